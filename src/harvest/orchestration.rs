//! Batch orchestration for the harvester
//!
//! This module drives a single run:
//! 1. Enumerates label directories under the asset root
//! 2. Runs the dedup pass over them
//! 3. Turns each label into tasks and feeds them to the worker pool
//! 4. Runs the dedup pass over the whole asset root
//! 5. Aggregates every task report into a batch summary

use std::fs;
use std::io::Error as IoError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::harvest::config_loader::{AppConfig, QueryMode, SubmissionMode};
use crate::harvest::dedup::{DedupPass, DedupReport, DirectoryDedup, NoopDedup};
use crate::harvest::download::{DownloadError, Downloader, init_downloader};
use crate::harvest::label_index::LabelIndex;
use crate::harvest::query_builder::QueryBuilder;
use crate::harvest::search::{GoogleImageSearch, ImageSearch, SearchError};
use crate::harvest::worker_pool::{Task, TaskHandle, TaskReport, WorkerPool, WorkerPoolConfig};

/// Error types for the orchestration layer
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    #[error("Search provider error: {0}")]
    Search(#[from] SearchError),

    #[error("Downloader error: {0}")]
    Download(#[from] DownloadError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Batch already started (state {0:?})")]
    AlreadyRun(BatchState),
}

/// Result type for orchestration operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Where a batch currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Idle,
    DedupPre,
    Running,
    DedupPost,
    Done,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub asset_root: PathBuf,
    pub query_mode: QueryMode,
    pub submission: SubmissionMode,
    pub show_progress: bool,
}

impl From<&AppConfig> for OrchestratorConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            asset_root: config.asset_root(),
            query_mode: config.query.mode,
            submission: config.pool.submission,
            show_progress: config.pool.show_progress,
        }
    }
}

/// Aggregated outcome of one run
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub elapsed_ms: u64,
    pub labels: usize,
    pub tasks_succeeded: usize,
    pub tasks_failed: usize,
    pub downloaded: usize,
    pub failed_downloads: usize,
    pub bytes_downloaded: u64,
    pub dedup_pre: Option<DedupReport>,
    pub dedup_post: Option<DedupReport>,
    pub dedup_errors: Vec<String>,
    pub reports: Vec<TaskReport>,
}

impl BatchSummary {
    fn new(labels: usize) -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            elapsed_ms: 0,
            labels,
            tasks_succeeded: 0,
            tasks_failed: 0,
            downloaded: 0,
            failed_downloads: 0,
            bytes_downloaded: 0,
            dedup_pre: None,
            dedup_post: None,
            dedup_errors: Vec::new(),
            reports: Vec::new(),
        }
    }

    fn record(&mut self, report: TaskReport) {
        if report.is_success() {
            self.tasks_succeeded += 1;
        } else {
            self.tasks_failed += 1;
        }
        self.downloaded += report.downloaded.len();
        self.failed_downloads += report.failed_downloads.len();
        self.bytes_downloaded += report.downloaded.iter().map(|d| d.bytes).sum::<u64>();
        self.reports.push(report);
    }

    /// Files removed by both dedup passes
    pub fn dedup_removed(&self) -> usize {
        [&self.dedup_pre, &self.dedup_post]
            .into_iter()
            .flatten()
            .map(DedupReport::removed)
            .sum()
    }

    fn finish(&mut self, elapsed: Duration) {
        self.finished_at = Some(Utc::now());
        self.elapsed_ms = elapsed.as_millis() as u64;
    }

    /// Write the summary as pretty JSON.
    pub fn write_to(&self, path: &Path) -> OrchestratorResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Drives one harvesting batch
pub struct Orchestrator {
    config: OrchestratorConfig,
    query_builder: QueryBuilder,
    pool: WorkerPool,
    dedup: Arc<dyn DedupPass>,
    state: RwLock<BatchState>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        query_builder: QueryBuilder,
        pool: WorkerPool,
        dedup: Arc<dyn DedupPass>,
    ) -> Self {
        Self {
            config,
            query_builder,
            pool,
            dedup,
            state: RwLock::new(BatchState::Idle),
        }
    }

    /// Wire up the default search provider, downloader and dedup pass.
    pub fn from_config(app_config: &AppConfig) -> OrchestratorResult<Self> {
        let search: Arc<dyn ImageSearch> = Arc::new(GoogleImageSearch::new(&app_config.search)?);
        let downloader: Arc<dyn Downloader> = init_downloader(app_config)?;
        let dedup: Arc<dyn DedupPass> = if app_config.dedup.enabled {
            Arc::new(DirectoryDedup::new(app_config.dedup.remove_empty))
        } else {
            Arc::new(NoopDedup)
        };

        let pool = WorkerPool::new(
            WorkerPoolConfig {
                size: app_config.pool.size,
                download_interval: app_config.download_interval(),
                task_timeout: app_config.task_timeout(),
            },
            search,
            downloader,
            Arc::new(LabelIndex::new()),
        );

        Ok(Self::new(
            OrchestratorConfig::from(app_config),
            QueryBuilder::new(app_config.query.tags.clone()),
            pool,
            dedup,
        ))
    }

    #[cfg(test)]
    pub fn state(&self) -> BatchState {
        *self.state.read()
    }

    fn set_state(&self, next: BatchState) {
        let mut state = self.state.write();
        info!("Batch state {:?} -> {:?}", *state, next);
        *state = next;
    }

    /// Tasks for one label, per the configured query mode
    pub fn plan_label(&self, label: &str) -> Vec<Task> {
        let dest_dir = self.config.asset_root.join(label);
        let queries = match self.config.query_mode {
            QueryMode::FullCombination => vec![self.query_builder.full_query(label)],
            QueryMode::EveryCombination => self.query_builder.build_queries(label),
        };

        queries
            .into_iter()
            .map(|query| {
                let task = Task::new(label, query, &dest_dir);
                info!(
                    "Planned {} for {} ({})",
                    task.query,
                    label,
                    self.query_builder.derive_label_path(&task.query)
                );
                task
            })
            .collect()
    }

    /// Run a whole batch. Only failing to read the asset root is an error;
    /// everything after that is recorded in the summary.
    pub async fn run_batch(&self) -> OrchestratorResult<BatchSummary> {
        let current = *self.state.read();
        if current != BatchState::Idle {
            return Err(OrchestratorError::AlreadyRun(current));
        }

        let start = Instant::now();
        let root = self.config.asset_root.clone();

        if !root.exists() {
            info!("Creating asset root: {}", root.display());
            fs::create_dir_all(&root)?;
        }
        let labels = list_labels(&root)?;
        info!("Found {} labels under {}", labels.len(), root.display());

        let mut summary = BatchSummary::new(labels.len());

        self.set_state(BatchState::DedupPre);
        let label_dirs: Vec<PathBuf> = labels.iter().map(|l| root.join(l)).collect();
        summary.dedup_pre = self.run_dedup(label_dirs, &mut summary.dedup_errors).await;

        self.set_state(BatchState::Running);
        info!("Submitting {:?} on {} pool slots", self.config.submission, self.pool.size());
        let progress = self.progress_bar(labels.len() as u64);
        match self.config.submission {
            SubmissionMode::Sequential => {
                for label in &labels {
                    progress.set_message(label.clone());
                    info!("Starting label {}", label);
                    let label_start = Instant::now();

                    let handles: Vec<TaskHandle> =
                        self.plan_label(label).into_iter().map(|t| self.pool.submit(t)).collect();
                    for handle in handles {
                        let report = handle.wait().await;
                        log_report(&report);
                        summary.record(report);
                    }

                    info!("Finished label {} in {:?}", label, label_start.elapsed());
                    progress.inc(1);
                }
            }
            SubmissionMode::Parallel => {
                let handles: Vec<TaskHandle> = labels
                    .iter()
                    .flat_map(|label| self.plan_label(label))
                    .map(|t| self.pool.submit(t))
                    .collect();
                progress.set_length(handles.len() as u64);

                let reports = futures::future::join_all(handles.into_iter().map(|h| async {
                    let report = h.wait().await;
                    progress.inc(1);
                    report
                }))
                .await;
                for report in reports {
                    log_report(&report);
                    summary.record(report);
                }
            }
        }
        progress.finish_with_message("done");
        // Every handle has resolved; nothing is submitted after this point
        self.pool.close();
        let pool_stats = self.pool.get_stats();
        info!(
            "Pool ran {} tasks: {} completed, {} failed, {} bytes downloaded",
            pool_stats.tasks_submitted,
            pool_stats.tasks_completed,
            pool_stats.tasks_failed,
            pool_stats.bytes_downloaded
        );

        self.set_state(BatchState::DedupPost);
        summary.dedup_post = self.run_dedup(vec![root], &mut summary.dedup_errors).await;

        self.set_state(BatchState::Done);
        summary.finish(start.elapsed());
        info!(
            "Batch finished in {:?}: {} labels, {} tasks ok, {} tasks failed, {} images downloaded, {} duplicates removed",
            start.elapsed(),
            summary.labels,
            summary.tasks_succeeded,
            summary.tasks_failed,
            summary.downloaded,
            summary.dedup_removed()
        );

        Ok(summary)
    }

    async fn run_dedup(&self, roots: Vec<PathBuf>, errors: &mut Vec<String>) -> Option<DedupReport> {
        let dedup = self.dedup.clone();
        match tokio::task::spawn_blocking(move || dedup.dedup(&roots)).await {
            Ok(Ok(report)) => Some(report),
            Ok(Err(e)) => {
                error!("Dedup pass failed: {}", e);
                errors.push(e.to_string());
                None
            }
            Err(e) => {
                error!("Dedup pass panicked: {}", e);
                errors.push(e.to_string());
                None
            }
        }
    }

    fn progress_bar(&self, len: u64) -> ProgressBar {
        if !self.config.show_progress || !console::user_attended_stderr() {
            return ProgressBar::hidden();
        }

        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        let bar = ProgressBar::new(len);
        bar.set_style(style);
        bar.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));
        bar
    }
}

fn log_report(report: &TaskReport) {
    match &report.failure {
        None => info!(
            "{} [{}]: {} of {} results saved",
            report.label,
            report.query,
            report.downloaded.len(),
            report.results_found
        ),
        Some(failure) => warn!("{} [{}] failed: {}", report.label, report.query, failure.message),
    }
}

/// Label directories under `root`, sorted. Files and hidden entries are not
/// labels.
pub fn list_labels(root: &Path) -> OrchestratorResult<Vec<String>> {
    let mut labels = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(name) if !name.starts_with('.') => labels.push(name),
            Ok(_) => {}
            Err(name) => warn!("Skipping label with a non UTF-8 name: {:?}", name),
        }
    }
    labels.sort();
    Ok(labels)
}

/// Build an orchestrator from the app config
pub fn init_orchestrator(app_config: &AppConfig) -> OrchestratorResult<Orchestrator> {
    Orchestrator::from_config(app_config)
}
