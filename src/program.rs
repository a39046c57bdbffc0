use std::env::consts::{ARCH, FAMILY, OS};
use std::env::current_dir;
use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use console::Term;
use tracing::{error, info, trace, warn};

use crate::harvest::{BatchSummary, init_config, init_logger, init_orchestrator};

/// The name of the cargo package.
const NAME: &str = env!("CARGO_PKG_NAME");

/// The version of the cargo package.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The authors who created the package.
const AUTHORS: &str = env!("CARGO_PKG_AUTHORS");

/// Directory holding `config.toml` when none is given on the command line.
const DEFAULT_CONFIG_DIR: &str = "./config";

/// File name of the summary written after each batch.
const SUMMARY_FILE: &str = "last_batch.json";

/// Runs one harvesting batch from start to finish.
pub(crate) struct Program {
    config_dir: PathBuf,
}

impl Program {
    pub(crate) fn new(config_dir: Option<String>) -> Self {
        Self {
            config_dir: PathBuf::from(config_dir.unwrap_or_else(|| DEFAULT_CONFIG_DIR.to_string())),
        }
    }

    pub(crate) async fn run(&self) -> Result<(), Error> {
        Term::stderr().set_title("image harvester");

        let config_manager = init_config(&self.config_dir)
            .with_context(|| format!("Failed to load config from {}", self.config_dir.display()))?;
        let config = config_manager.get_app_config();

        let log_dir = PathBuf::from(&config.paths.log_directory);
        let _logger_guard = init_logger(&config.logging, &log_dir).context("Failed to initialize logging")?;
        config_manager.log_load_events();

        trace!("Starting {}...", NAME);
        trace!("Program Version: {}", VERSION);
        trace!("Program Authors: {}", AUTHORS);
        log_system_information();
        if let Ok(dir) = current_dir() {
            trace!("Program Working Directory: {}", dir.display());
        }
        info!("Config loaded from {}", config_manager.config_dir().display());

        let orchestrator = init_orchestrator(&config).context("Failed to set up the harvester")?;
        let summary = orchestrator.run_batch().await.map_err(|e| {
            error!("Batch aborted: {}", e);
            e
        })?;

        write_summary(&summary, &log_dir.join(SUMMARY_FILE));

        if summary.tasks_failed > 0 {
            warn!("{} of {} tasks failed", summary.tasks_failed, summary.reports.len());
        }
        info!(
            "Downloaded {} images into {}",
            summary.downloaded,
            config.asset_root().display()
        );

        Ok(())
    }
}

fn write_summary(summary: &BatchSummary, path: &Path) {
    match summary.write_to(path) {
        Ok(()) => info!("Batch summary written to {}", path.display()),
        Err(e) => warn!("Failed to write batch summary to {}: {}", path.display(), e),
    }
}

/// Logs important information about the system being used.
fn log_system_information() {
    trace!("Printing system information out into log for debug purposes...");
    trace!("ARCH:           \"{}\"", ARCH);
    trace!("FAMILY:         \"{}\"", FAMILY);
    trace!("OS:             \"{}\"", OS);
    trace!("CPUS:           \"{}\"", num_cpus::get());
}
