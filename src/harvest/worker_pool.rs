//! Bounded worker pool for search-and-download tasks
//!
//! This module provides a pool that:
//! 1. Runs at most `size` tasks at once (Semaphore permits)
//! 2. Executes one search per task, then its downloads strictly in order
//! 3. Paces downloads inside a task with a fixed-interval rate limiter
//! 4. Reserves file names per label so concurrent tasks never collide
//! 5. Reports every outcome back as a structured `TaskReport`

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::harvest::download::Downloader;
use crate::harvest::label_index::LabelIndex;
use crate::harvest::query_builder::QueryCombination;
use crate::harvest::rate_limiter::RateLimiter;
use crate::harvest::search::{ImageSearch, SearchError};

/// Reasons a whole task can fail
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Search failed: {0}")]
    Fetch(#[from] SearchError),

    #[error("Filesystem error: {0}")]
    Filesystem(#[from] io::Error),

    #[error("Task timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Worker pool closed")]
    PoolClosed,

    #[error("Task aborted: {0}")]
    Aborted(String),
}

/// Result type for task execution
pub type TaskResult<T> = Result<T, TaskError>;

/// Unit of work: one query for one label
#[derive(Debug, Clone)]
pub struct Task {
    pub id: Uuid,
    pub label: String,
    pub query: QueryCombination,
    pub dest_dir: PathBuf,
}

impl Task {
    pub fn new(label: impl Into<String>, query: QueryCombination, dest_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: label.into(),
            query,
            dest_dir: dest_dir.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Fetch,
    Filesystem,
    TimedOut,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl From<&TaskError> for TaskFailure {
    fn from(error: &TaskError) -> Self {
        let kind = match error {
            TaskError::Fetch(_) => FailureKind::Fetch,
            TaskError::Filesystem(_) => FailureKind::Filesystem,
            TaskError::TimedOut(_) => FailureKind::TimedOut,
            TaskError::PoolClosed | TaskError::Aborted(_) => FailureKind::Aborted,
        };
        Self {
            kind,
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadedAsset {
    pub url: String,
    pub path: PathBuf,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedDownload {
    pub url: String,
    pub path: PathBuf,
    pub error: String,
}

/// What happened to one task
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task_id: Uuid,
    pub label: String,
    pub query: String,
    pub status: TaskStatus,
    pub failure: Option<TaskFailure>,
    pub results_found: usize,
    pub downloaded: Vec<DownloadedAsset>,
    pub failed_downloads: Vec<FailedDownload>,
    pub elapsed_ms: u64,
}

impl TaskReport {
    fn new(task: &Task) -> Self {
        Self {
            task_id: task.id,
            label: task.label.clone(),
            query: task.query.clone(),
            status: TaskStatus::Completed,
            failure: None,
            results_found: 0,
            downloaded: Vec::new(),
            failed_downloads: Vec::new(),
            elapsed_ms: 0,
        }
    }

    fn fail(&mut self, error: &TaskError) {
        self.status = TaskStatus::Failed;
        self.failure = Some(TaskFailure::from(error));
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

/// Pool statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub tasks_submitted: usize,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub downloads_completed: usize,
    pub downloads_failed: usize,
    pub bytes_downloaded: u64,
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub size: usize,
    pub download_interval: Duration,
    pub task_timeout: Option<Duration>,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            download_interval: Duration::from_secs(1),
            task_timeout: None,
        }
    }
}

/// Handle to a submitted task
pub struct TaskHandle {
    task_id: Uuid,
    label: String,
    query: String,
    handle: JoinHandle<TaskReport>,
}

impl TaskHandle {
    /// Wait for the task to finish. A panicked or cancelled task comes back as
    /// a failed report rather than an error.
    pub async fn wait(self) -> TaskReport {
        match self.handle.await {
            Ok(report) => report,
            Err(e) => {
                error!("Task join error for {}: {}", self.label, e);
                let task = Task {
                    id: self.task_id,
                    label: self.label,
                    query: self.query,
                    dest_dir: PathBuf::new(),
                };
                let mut report = TaskReport::new(&task);
                report.fail(&TaskError::Aborted(e.to_string()));
                report
            }
        }
    }
}

struct PoolShared {
    config: WorkerPoolConfig,
    semaphore: Arc<Semaphore>,
    search: Arc<dyn ImageSearch>,
    downloader: Arc<dyn Downloader>,
    label_index: Arc<LabelIndex>,
    stats: Mutex<PoolStats>,
}

/// Fixed-size pool executing search-and-download tasks
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        search: Arc<dyn ImageSearch>,
        downloader: Arc<dyn Downloader>,
        label_index: Arc<LabelIndex>,
    ) -> Self {
        let size = config.size.max(1);
        info!("Worker pool started with {} slots", size);
        Self {
            shared: Arc::new(PoolShared {
                semaphore: Arc::new(Semaphore::new(size)),
                config,
                search,
                downloader,
                label_index,
                stats: Mutex::new(PoolStats::default()),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.shared.config.size.max(1)
    }

    pub fn get_stats(&self) -> PoolStats {
        self.shared.stats.lock().clone()
    }

    /// Queue a task. It starts as soon as a slot frees up.
    pub fn submit(&self, task: Task) -> TaskHandle {
        self.shared.stats.lock().tasks_submitted += 1;

        let task_id = task.id;
        let label = task.label.clone();
        let query = task.query.clone();
        let span = info_span!("task", label = %task.label, trace_id = %task.id);
        let shared = self.shared.clone();

        let handle = tokio::spawn(async move { Self::run(shared, task).await }.instrument(span));

        TaskHandle {
            task_id,
            label,
            query,
            handle,
        }
    }

    /// Stop handing out slots; tasks still waiting for one fail as aborted.
    pub fn close(&self) {
        self.shared.semaphore.close();
    }

    async fn run(shared: Arc<PoolShared>, task: Task) -> TaskReport {
        let mut report = TaskReport::new(&task);

        let _permit = match shared.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                report.fail(&TaskError::PoolClosed);
                shared.stats.lock().tasks_failed += 1;
                return report;
            }
        };

        let start = Instant::now();
        info!("Searching for {}", task.query);

        let mut in_flight: Option<PathBuf> = None;
        let result = {
            let work = Self::execute(&shared, &task, &mut report, &mut in_flight);
            match shared.config.task_timeout {
                Some(limit) => match tokio::time::timeout(limit, work).await {
                    Ok(result) => result,
                    Err(_) => Err(TaskError::TimedOut(limit)),
                },
                None => work.await,
            }
        };

        // A timeout can interrupt a transfer midway
        if let Some(path) = in_flight.take() {
            remove_partial(&path).await;
        }

        if let Err(e) = &result {
            error!("Task for {} failed: {}", task.label, e);
            report.fail(e);
        }
        report.elapsed_ms = start.elapsed().as_millis() as u64;

        {
            let mut stats = shared.stats.lock();
            if report.is_success() {
                stats.tasks_completed += 1;
            } else {
                stats.tasks_failed += 1;
            }
            stats.downloads_completed += report.downloaded.len();
            stats.downloads_failed += report.failed_downloads.len();
            stats.bytes_downloaded += report.downloaded.iter().map(|d| d.bytes).sum::<u64>();
        }

        info!(
            "Finished {} in {}ms: {} downloaded, {} failed",
            task.label,
            report.elapsed_ms,
            report.downloaded.len(),
            report.failed_downloads.len()
        );
        report
    }

    async fn execute(
        shared: &PoolShared,
        task: &Task,
        report: &mut TaskReport,
        in_flight: &mut Option<PathBuf>,
    ) -> TaskResult<()> {
        let results = shared.search.search(&task.query, true).await?;
        report.results_found = results.len();
        info!("Search returned {} results", results.len());

        let limiter = RateLimiter::new(shared.config.download_interval);

        for result in results {
            limiter.wait_for_request().await;

            if !task.dest_dir.exists() {
                tokio::fs::create_dir_all(&task.dest_dir).await?;
                debug!("Created directory: {}", task.dest_dir.display());
            }
            let reserved = shared.label_index.reserve(&task.dest_dir)?;

            *in_flight = Some(reserved.path.clone());
            match shared.downloader.fetch_to_file(&result.url, &reserved.path).await {
                Ok(bytes) => {
                    debug!("Saved {} as #{} ({} bytes)", reserved.path.display(), reserved.index, bytes);
                    report.downloaded.push(DownloadedAsset {
                        url: result.url,
                        path: reserved.path,
                        bytes,
                    });
                }
                Err(e) => {
                    warn!("Download of {} failed: {}", result.url, e);
                    remove_partial(&reserved.path).await;
                    report.failed_downloads.push(FailedDownload {
                        url: result.url,
                        path: reserved.path,
                        error: e.to_string(),
                    });
                }
            }
            *in_flight = None;
        }

        let pacing = limiter.get_stats();
        debug!(
            interval = ?pacing.interval,
            requests = pacing.total_requests,
            waited = ?pacing.total_waited,
            "Download pacing"
        );

        Ok(())
    }
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed partial file {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial file {}: {}", path.display(), e),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::harvest::download::{DownloadError, DownloadResult};
    use crate::harvest::search::{SearchResult, SearchResultOf};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Search provider answering from a fixed table
    #[derive(Default)]
    pub(crate) struct FakeSearch {
        pub results: HashMap<String, Vec<String>>,
        pub failing: Vec<String>,
        pub delay: Option<Duration>,
        pub calls: Mutex<Vec<(String, bool)>>,
    }

    impl FakeSearch {
        pub(crate) fn with(mut self, query: &str, urls: &[&str]) -> Self {
            self.results
                .insert(query.to_string(), urls.iter().map(|u| u.to_string()).collect());
            self
        }

        pub(crate) fn failing_on(mut self, query: &str) -> Self {
            self.failing.push(query.to_string());
            self
        }
    }

    #[async_trait]
    impl ImageSearch for FakeSearch {
        async fn search(&self, query: &str, safe: bool) -> SearchResultOf<Vec<SearchResult>> {
            self.calls.lock().push((query.to_string(), safe));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing.iter().any(|q| q == query) {
                return Err(SearchError::Provider("HTTP error: 503".to_string()));
            }
            Ok(self
                .results
                .get(query)
                .map(|urls| urls.iter().map(SearchResult::new).collect())
                .unwrap_or_default())
        }
    }

    /// Writes the URL into the destination; URLs containing "broken" write a
    /// partial file and then fail. `stall` hangs after the write.
    #[derive(Default)]
    pub(crate) struct FakeDownloader {
        pub delay: Option<Duration>,
        pub stall: Option<Duration>,
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl Downloader for FakeDownloader {
        async fn fetch_to_file(&self, url: &str, dest: &Path) -> DownloadResult<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            tokio::fs::write(dest, url.as_bytes()).await?;
            if let Some(stall) = self.stall {
                tokio::time::sleep(stall).await;
            }
            if url.contains("broken") {
                return Err(DownloadError::Download("connection reset".to_string()));
            }
            Ok(url.len() as u64)
        }
    }

    fn pool(search: FakeSearch, downloader: FakeDownloader, config: WorkerPoolConfig) -> WorkerPool {
        WorkerPool::new(config, Arc::new(search), Arc::new(downloader), Arc::new(LabelIndex::new()))
    }

    fn fast_config(size: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            size,
            download_interval: Duration::ZERO,
            task_timeout: None,
        }
    }

    #[tokio::test]
    async fn test_task_downloads_every_result_in_order() {
        let dir = tempdir().unwrap();
        let search = FakeSearch::default().with("\"cat\" \"neko\"", &["https://a/1", "https://a/2"]);
        let pool = pool(search, FakeDownloader::default(), fast_config(2));

        let label_dir = dir.path().join("cat");
        let report = pool
            .submit(Task::new("cat", "\"cat\" \"neko\"".to_string(), &label_dir))
            .wait()
            .await;

        assert!(report.is_success());
        assert_eq!(report.results_found, 2);
        assert_eq!(std::fs::read_to_string(label_dir.join("0.jpg")).unwrap(), "https://a/1");
        assert_eq!(std::fs::read_to_string(label_dir.join("1.jpg")).unwrap(), "https://a/2");
        assert_eq!(pool.get_stats().downloads_completed, 2);
    }

    #[tokio::test]
    async fn test_search_is_always_safe() {
        let dir = tempdir().unwrap();
        let search = Arc::new(FakeSearch::default());
        let pool = WorkerPool::new(
            fast_config(1),
            search.clone(),
            Arc::new(FakeDownloader::default()),
            Arc::new(LabelIndex::new()),
        );

        pool.submit(Task::new("cat", "\"cat\"".to_string(), dir.path().join("cat")))
            .wait()
            .await;

        assert_eq!(search.calls.lock().as_slice(), &[("\"cat\"".to_string(), true)]);
    }

    #[tokio::test]
    async fn test_next_index_follows_existing_files() {
        let dir = tempdir().unwrap();
        let label_dir = dir.path().join("cat");
        std::fs::create_dir_all(&label_dir).unwrap();
        for i in 0..3 {
            std::fs::write(label_dir.join(format!("{}.jpg", i)), b"old").unwrap();
        }
        let search = FakeSearch::default().with("\"cat\"", &["https://a/new"]);
        let pool = pool(search, FakeDownloader::default(), fast_config(1));

        let report = pool.submit(Task::new("cat", "\"cat\"".to_string(), &label_dir)).wait().await;

        assert_eq!(report.downloaded[0].path, label_dir.join("3.jpg"));
        assert_eq!(std::fs::read_to_string(label_dir.join("3.jpg")).unwrap(), "https://a/new");
    }

    #[tokio::test]
    async fn test_failed_download_leaves_no_file() {
        let dir = tempdir().unwrap();
        let label_dir = dir.path().join("cat");
        let search = FakeSearch::default().with("\"cat\"", &["https://a/broken", "https://a/ok"]);
        let pool = pool(search, FakeDownloader::default(), fast_config(1));

        let report = pool.submit(Task::new("cat", "\"cat\"".to_string(), &label_dir)).wait().await;

        // the task itself still succeeds
        assert!(report.is_success());
        assert_eq!(report.failed_downloads.len(), 1);
        assert!(!report.failed_downloads[0].path.exists());
        assert_eq!(report.downloaded.len(), 1);
        assert!(report.downloaded[0].path.exists());
    }

    #[tokio::test]
    async fn test_search_failure_fails_only_that_task() {
        let dir = tempdir().unwrap();
        let search = FakeSearch::default()
            .failing_on("\"cat\"")
            .with("\"dog\"", &["https://a/dog"]);
        let pool = pool(search, FakeDownloader::default(), fast_config(2));

        let cat = pool.submit(Task::new("cat", "\"cat\"".to_string(), dir.path().join("cat")));
        let dog = pool.submit(Task::new("dog", "\"dog\"".to_string(), dir.path().join("dog")));
        let cat = cat.wait().await;
        let dog = dog.wait().await;

        assert_eq!(cat.status, TaskStatus::Failed);
        assert_eq!(cat.failure.as_ref().map(|f| f.kind), Some(FailureKind::Fetch));
        assert!(!dir.path().join("cat").exists());
        assert!(dog.is_success());
        assert!(dir.path().join("dog").join("0.jpg").exists());

        let stats = pool.get_stats();
        assert_eq!(stats.tasks_failed, 1);
        assert_eq!(stats.tasks_completed, 1);
    }

    #[tokio::test]
    async fn test_directory_creation_failure_is_task_fatal() {
        let dir = tempdir().unwrap();
        // a regular file where the label directory should go
        let blocked = dir.path().join("cat");
        std::fs::write(&blocked, b"not a directory").unwrap();
        let search = FakeSearch::default().with("\"cat\"", &["https://a/1"]);
        let pool = pool(search, FakeDownloader::default(), fast_config(1));

        let report = pool.submit(Task::new("cat", "\"cat\"".to_string(), &blocked)).wait().await;

        assert_eq!(report.failure.map(|f| f.kind), Some(FailureKind::Filesystem));
    }

    #[tokio::test]
    async fn test_concurrent_tasks_same_label_do_not_collide() {
        let dir = tempdir().unwrap();
        let label_dir = dir.path().join("cat");
        let search = FakeSearch::default()
            .with("\"cat\"", &["https://a/1", "https://a/2", "https://a/3"])
            .with("\"cat\" \"neko\"", &["https://b/1", "https://b/2", "https://b/3"]);
        let downloader = FakeDownloader {
            delay: Some(Duration::from_millis(10)),
            ..Default::default()
        };
        let pool = pool(search, downloader, fast_config(2));

        let a = pool.submit(Task::new("cat", "\"cat\"".to_string(), &label_dir));
        let b = pool.submit(Task::new("cat", "\"cat\" \"neko\"".to_string(), &label_dir));
        a.wait().await;
        b.wait().await;

        let count = std::fs::read_dir(&label_dir).unwrap().count();
        assert_eq!(count, 6);
    }

    #[tokio::test]
    async fn test_task_timeout() {
        let dir = tempdir().unwrap();
        let search = FakeSearch {
            delay: Some(Duration::from_millis(500)),
            ..Default::default()
        };
        let config = WorkerPoolConfig {
            task_timeout: Some(Duration::from_millis(50)),
            ..fast_config(1)
        };
        let pool = pool(search, FakeDownloader::default(), config);

        let report = pool.submit(Task::new("cat", "\"cat\"".to_string(), dir.path().join("cat"))).wait().await;

        assert_eq!(report.failure.map(|f| f.kind), Some(FailureKind::TimedOut));
    }

    #[tokio::test]
    async fn test_timeout_mid_transfer_removes_partial_file() {
        let dir = tempdir().unwrap();
        let label_dir = dir.path().join("cat");
        let search = FakeSearch::default().with("\"cat\"", &["https://a/slow"]);
        let downloader = FakeDownloader {
            stall: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let config = WorkerPoolConfig {
            task_timeout: Some(Duration::from_millis(100)),
            ..fast_config(1)
        };
        let pool = pool(search, downloader, config);

        let report = pool.submit(Task::new("cat", "\"cat\"".to_string(), &label_dir)).wait().await;

        assert_eq!(report.failure.map(|f| f.kind), Some(FailureKind::TimedOut));
        assert!(label_dir.is_dir());
        assert!(!label_dir.join("0.jpg").exists());
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let dir = tempdir().unwrap();
        let search = FakeSearch {
            delay: Some(Duration::from_millis(100)),
            ..Default::default()
        };
        let pool = pool(search, FakeDownloader::default(), fast_config(2));

        let start = Instant::now();
        let handles: Vec<_> = (0..4)
            .map(|i| pool.submit(Task::new(format!("l{}", i), format!("\"l{}\"", i), dir.path().join(i.to_string()))))
            .collect();
        for handle in handles {
            handle.wait().await;
        }

        // four 100ms searches through two slots take at least two rounds
        assert!(start.elapsed() >= Duration::from_millis(190));
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_waiting_tasks() {
        let dir = tempdir().unwrap();
        let pool = pool(FakeSearch::default(), FakeDownloader::default(), fast_config(1));
        pool.close();

        let report = pool.submit(Task::new("cat", "\"cat\"".to_string(), dir.path().join("cat"))).wait().await;

        assert_eq!(report.failure.map(|f| f.kind), Some(FailureKind::Aborted));
    }
}
