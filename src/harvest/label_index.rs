//! Per-label filename allocation
//!
//! Files are named `<n>.jpg`. The first index handed out for a directory is
//! the number of entries it holds at that moment; later indices come from an
//! in-memory counter, so tasks sharing a directory never compute the same
//! name. Names already present on disk are skipped.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

/// Extension given to every downloaded asset
pub const ASSET_EXTENSION: &str = "jpg";

/// A reserved destination inside a label directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedFile {
    pub index: u64,
    pub path: PathBuf,
}

#[derive(Debug, Default)]
pub struct LabelIndex {
    next: DashMap<PathBuf, Arc<Mutex<Option<u64>>>>,
}

impl LabelIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next free `<n>.jpg` in `dir`. The directory must exist.
    pub fn reserve(&self, dir: &Path) -> io::Result<ReservedFile> {
        let slot = self
            .next
            .entry(dir.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone();

        let mut next = slot.lock();
        let mut index = match *next {
            Some(n) => n,
            None => {
                let seeded = count_entries(dir)?;
                debug!("Seeded index for {} at {}", dir.display(), seeded);
                seeded
            }
        };

        let mut path = asset_path(dir, index);
        while path.exists() {
            index += 1;
            path = asset_path(dir, index);
        }

        *next = Some(index + 1);
        Ok(ReservedFile { index, path })
    }
}

pub fn asset_path(dir: &Path, index: u64) -> PathBuf {
    dir.join(format!("{}.{}", index, ASSET_EXTENSION))
}

/// Number of entries in a directory listing
pub fn count_entries(dir: &Path) -> io::Result<u64> {
    let mut count = 0;
    for entry in fs::read_dir(dir)? {
        entry?;
        count += 1;
    }
    Ok(count)
}
