//! Duplicate removal over the asset tree
//!
//! Files are compared within their own directory only: the same picture under
//! two labels is legitimate. Candidates are grouped by length and then
//! compared byte for byte; within a group the file with the lowest index is
//! kept. Zero-length files are what an aborted transfer leaves behind and are
//! removed as well.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Error types for the dedup pass
#[derive(Error, Debug)]
pub enum DedupError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

/// Result type for dedup operations
pub type DedupResult<T> = Result<T, DedupError>;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct DedupReport {
    pub scanned_files: usize,
    pub removed_duplicates: Vec<PathBuf>,
    pub removed_empty: Vec<PathBuf>,
    pub errors: usize,
}

impl DedupReport {
    pub fn removed(&self) -> usize {
        self.removed_duplicates.len() + self.removed_empty.len()
    }

    fn merge(&mut self, other: DedupReport) {
        self.scanned_files += other.scanned_files;
        self.removed_duplicates.extend(other.removed_duplicates);
        self.removed_empty.extend(other.removed_empty);
        self.errors += other.errors;
    }
}

/// Removes duplicate entries below a set of directories. Must be idempotent
/// and safe to run on a partially populated tree.
pub trait DedupPass: Send + Sync {
    fn dedup(&self, roots: &[PathBuf]) -> DedupResult<DedupReport>;
}

/// Byte-identical duplicate removal per directory
#[derive(Debug, Clone)]
pub struct DirectoryDedup {
    remove_empty: bool,
}

impl DirectoryDedup {
    pub fn new(remove_empty: bool) -> Self {
        Self { remove_empty }
    }

    fn dedup_root(&self, root: &Path) -> DedupResult<DedupReport> {
        let mut report = DedupReport::default();
        // (directory, length) -> files
        let mut groups: BTreeMap<(PathBuf, u64), Vec<PathBuf>> = BTreeMap::new();

        let walker = WalkDir::new(root).min_depth(1).follow_links(false).into_iter();
        for entry in walker.filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name().to_str())) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.depth() == 0 => return Err(e.into()),
                Err(e) => {
                    warn!("Error accessing path under {}: {}", root.display(), e);
                    report.errors += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            report.scanned_files += 1;

            let len = match entry.metadata() {
                Ok(meta) => meta.len(),
                Err(e) => {
                    warn!("Failed to read metadata for {}: {}", entry.path().display(), e);
                    report.errors += 1;
                    continue;
                }
            };

            let path = entry.into_path();
            if len == 0 && self.remove_empty {
                match fs::remove_file(&path) {
                    Ok(()) => report.removed_empty.push(path),
                    Err(e) => {
                        warn!("Failed to remove empty file {}: {}", path.display(), e);
                        report.errors += 1;
                    }
                }
                continue;
            }

            let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
            groups.entry((dir, len)).or_default().push(path);
        }

        for ((_, len), mut files) in groups {
            if files.len() < 2 {
                continue;
            }
            files.sort_by(|a, b| asset_order(a).cmp(&asset_order(b)));
            debug!("Comparing {} files of {} bytes", files.len(), len);
            remove_identical(files, &mut report);
        }

        Ok(report)
    }
}

impl DedupPass for DirectoryDedup {
    fn dedup(&self, roots: &[PathBuf]) -> DedupResult<DedupReport> {
        let mut report = DedupReport::default();
        for root in roots {
            match self.dedup_root(root) {
                Ok(root_report) => report.merge(root_report),
                Err(e) => {
                    warn!("Skipping {}: {}", root.display(), e);
                    report.errors += 1;
                }
            }
        }

        info!(
            "Dedup scanned {} files, removed {} duplicates and {} empty files",
            report.scanned_files,
            report.removed_duplicates.len(),
            report.removed_empty.len()
        );
        Ok(report)
    }
}

/// Dedup pass that leaves the tree alone
#[derive(Debug, Default, Clone)]
pub struct NoopDedup;

impl DedupPass for NoopDedup {
    fn dedup(&self, _roots: &[PathBuf]) -> DedupResult<DedupReport> {
        Ok(DedupReport::default())
    }
}

/// Keeps the first file of every set of identical files in `files`.
fn remove_identical(files: Vec<PathBuf>, report: &mut DedupReport) {
    let mut kept: Vec<PathBuf> = Vec::new();

    'candidates: for candidate in files {
        for original in &kept {
            match files_equal(original, &candidate) {
                Ok(true) => {
                    match fs::remove_file(&candidate) {
                        Ok(()) => {
                            debug!("Removed {} (same as {})", candidate.display(), original.display());
                            report.removed_duplicates.push(candidate);
                        }
                        Err(e) => {
                            warn!("Failed to remove duplicate {}: {}", candidate.display(), e);
                            report.errors += 1;
                        }
                    }
                    continue 'candidates;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to compare {} with {}: {}", candidate.display(), original.display(), e);
                    report.errors += 1;
                    continue 'candidates;
                }
            }
        }
        kept.push(candidate);
    }
}

fn files_equal(a: &Path, b: &Path) -> io::Result<bool> {
    let mut left = BufReader::new(File::open(a)?);
    let mut right = BufReader::new(File::open(b)?);
    let mut left_buf = [0u8; 8192];
    let mut right_buf = [0u8; 8192];

    loop {
        let n = read_full(&mut left, &mut left_buf)?;
        let m = read_full(&mut right, &mut right_buf)?;
        if n != m || left_buf[..n] != right_buf[..m] {
            return Ok(false);
        }
        if n == 0 {
            return Ok(true);
        }
    }
}

/// Fills `buf` as far as the reader allows.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Numeric stems sort by value (`2.jpg` before `10.jpg`), everything else after.
fn asset_order(path: &Path) -> (u64, String) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let index = path
        .file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(u64::MAX);
    (index, name)
}

fn is_hidden(name: Option<&str>) -> bool {
    name.is_some_and(|n| n.starts_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn populate(root: &Path) {
        let cat = root.join("cat");
        let dog = root.join("dog");
        fs::create_dir_all(&cat).unwrap();
        fs::create_dir_all(&dog).unwrap();
        fs::write(cat.join("0.jpg"), b"aaaa").unwrap();
        fs::write(cat.join("1.jpg"), b"bbbb").unwrap();
        fs::write(cat.join("2.jpg"), b"aaaa").unwrap();
        fs::write(cat.join("10.jpg"), b"aaaa").unwrap();
        fs::write(cat.join("3.jpg"), b"").unwrap();
        // identical to cat/0.jpg but under another label
        fs::write(dog.join("0.jpg"), b"aaaa").unwrap();
    }

    #[test]
    fn test_removes_duplicates_within_a_label() {
        let dir = tempdir().unwrap();
        populate(dir.path());

        let report = DirectoryDedup::new(true).dedup(&[dir.path().to_path_buf()]).unwrap();

        let cat = dir.path().join("cat");
        assert!(cat.join("0.jpg").exists());
        assert!(cat.join("1.jpg").exists());
        assert!(!cat.join("2.jpg").exists());
        assert!(!cat.join("10.jpg").exists());
        assert!(!cat.join("3.jpg").exists());
        assert!(dir.path().join("dog").join("0.jpg").exists());
        assert_eq!(report.removed_duplicates.len(), 2);
        assert_eq!(report.removed_empty, vec![cat.join("3.jpg")]);
        assert_eq!(report.scanned_files, 6);
    }

    #[test]
    fn test_second_run_changes_nothing() {
        let dir = tempdir().unwrap();
        populate(dir.path());
        let dedup = DirectoryDedup::new(true);
        let roots = [dir.path().to_path_buf()];

        dedup.dedup(&roots).unwrap();
        let second = dedup.dedup(&roots).unwrap();

        assert_eq!(second.removed(), 0);
        assert_eq!(second.scanned_files, 3);
    }

    #[test]
    fn test_keeps_empty_files_when_asked() {
        let dir = tempdir().unwrap();
        populate(dir.path());

        let report = DirectoryDedup::new(false).dedup(&[dir.path().join("cat")]).unwrap();

        assert!(report.removed_empty.is_empty());
        assert!(dir.path().join("cat").join("3.jpg").exists());
    }

    #[test]
    fn test_same_length_different_content_is_kept() {
        let dir = tempdir().unwrap();
        let big_a: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let mut big_b = big_a.clone();
        big_b[19_999] ^= 0xff;
        fs::write(dir.path().join("0.jpg"), &big_a).unwrap();
        fs::write(dir.path().join("1.jpg"), &big_b).unwrap();

        let report = DirectoryDedup::new(true).dedup(&[dir.path().to_path_buf()]).unwrap();

        assert_eq!(report.removed(), 0);
    }

    #[test]
    fn test_unreadable_root_does_not_stop_the_others() {
        let dir = tempdir().unwrap();
        populate(dir.path());
        let roots = [dir.path().join("nope"), dir.path().join("cat")];

        let report = DirectoryDedup::new(true).dedup(&roots).unwrap();

        assert_eq!(report.errors, 1);
        assert_eq!(report.removed_duplicates.len(), 2);
        assert!(!dir.path().join("cat").join("2.jpg").exists());
    }

    #[test]
    fn test_asset_order_is_numeric() {
        let mut files = vec![PathBuf::from("10.jpg"), PathBuf::from("b.jpg"), PathBuf::from("2.jpg")];
        files.sort_by(|a, b| asset_order(a).cmp(&asset_order(b)));
        assert_eq!(files, vec![PathBuf::from("2.jpg"), PathBuf::from("10.jpg"), PathBuf::from("b.jpg")]);
    }
}
