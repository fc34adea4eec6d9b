//! Run a full benchmark against a remote storage service and report the outcome.
//!
//! A run creates a repository, uploads [`RunConfig::files_amount`] objects into it and then reads
//! all of them back. Both phases are driven by a [`WorkerPool`] and retry every object according
//! to the configured [`RetryPolicy`]. Objects that fail on every attempt are logged and counted,
//! but never fail the run.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use yansi::Paint;

use crate::content::ContentTemplate;
use crate::pool::{Operation, PhaseReport, WorkerPool};
use crate::queue::WorkItem;
use crate::remote::SharedRemote;
use crate::retry::RetryPolicy;

/// Settings of a single benchmark run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunConfig {
    /// Name of the repository created for the run.
    pub repository: String,
    /// Storage namespace the repository is created in.
    pub storage_namespace: String,
    /// Default branch of the repository, used for uploads and reads.
    pub branch: String,
    /// Number of concurrent workers per phase.
    pub parallelism_level: usize,
    /// Number of objects per phase.
    pub files_amount: u64,
    /// Deadline for the whole run.
    pub global_timeout: Duration,
    /// Size of every uploaded object in bytes.
    pub content_length: usize,
    /// Number of trailing bytes that are randomized per object.
    pub content_suffix_length: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            repository: "testbenchmark".into(),
            storage_namespace: String::new(),
            branch: "master".into(),
            parallelism_level: 500,
            files_amount: 10_000,
            global_timeout: Duration::from_secs(30 * 60),
            content_length: 1024,
            content_suffix_length: 32,
        }
    }
}

/// Outcome of a benchmark run.
#[derive(Clone, Debug)]
pub struct RunReport {
    /// The repository that was created for the run.
    pub repository: String,
    /// Results of the upload phase.
    pub upload: PhaseReport,
    /// Results of the read phase.
    pub read: PhaseReport,
}

impl RunReport {
    /// Prints a human readable summary to stdout.
    pub fn print(&self) {
        println!();
        println!(
            "{} {}",
            "## Benchmark".bold(),
            self.repository.as_str().bold().blue()
        );
        print_phase(&self.upload);
        print_phase(&self.read);
    }
}

fn print_phase(report: &PhaseReport) {
    print!(
        "{} ({} of {} files",
        format!("{}:", report.phase.to_uppercase()).bold().green(),
        report.processed().bold(),
        report.total
    );
    if report.failed > 0 {
        print!(", {}", format!("{} FAILURES", report.failed).bold().red());
    }
    if !report.is_complete() {
        print!(", {}", "CANCELLED".bold().yellow());
    }
    println!(")");
    println!(
        "  {:.2} operations/s; elapsed: {:.2?}",
        report.ops_per_second().bold(),
        report.elapsed
    );
}

/// Uploads one object per work item, made unique by a random suffix.
#[derive(Debug)]
pub(crate) struct Upload {
    pub remote: SharedRemote,
    pub repository: String,
    pub branch: String,
    pub template: ContentTemplate,
}

#[async_trait::async_trait]
impl Operation for Upload {
    type Input = Bytes;

    fn name(&self) -> &'static str {
        "upload"
    }

    fn prepare(&self, _item: &WorkItem) -> Bytes {
        self.template.render(&mut rand::rng())
    }

    async fn execute(&self, item: &WorkItem, content: &Bytes) -> crate::Result<()> {
        self.remote
            .upload_object(&self.repository, &self.branch, item.as_str(), content.clone())
            .await
    }
}

/// Reads back the object of every work item, discarding its contents.
#[derive(Debug)]
pub(crate) struct Read {
    pub remote: SharedRemote,
    pub repository: String,
    pub reference: String,
}

#[async_trait::async_trait]
impl Operation for Read {
    type Input = ();

    fn name(&self) -> &'static str {
        "read"
    }

    fn prepare(&self, _item: &WorkItem) {}

    async fn execute(&self, item: &WorkItem, _input: &()) -> crate::Result<()> {
        self.remote
            .get_object(&self.repository, &self.reference, item.as_str())
            .await?;
        Ok(())
    }
}

/// Orchestrates a benchmark run.
///
/// All components receive the remote and the run's cancellation token explicitly, there is no
/// global state. The token is cancelled when the global timeout elapses, and may also be cancelled
/// from the outside through [`cancellation_token`](Self::cancellation_token).
#[derive(Debug)]
pub struct BenchmarkDriver {
    remote: SharedRemote,
    config: RunConfig,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl BenchmarkDriver {
    /// Creates a driver for the given remote and settings.
    pub fn new(remote: SharedRemote, config: RunConfig) -> Self {
        Self {
            remote,
            config,
            retry: RetryPolicy::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Replaces the default retry policy for uploads and reads.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// A token that stops the run once cancelled.
    ///
    /// Workers finish the item they are working on, then exit.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The settings of this run.
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Runs the benchmark to completion, or until the run is cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository cannot be created. Failures of individual objects are
    /// only counted in the returned [`RunReport`].
    pub async fn run(&self) -> Result<RunReport> {
        let deadline = self.spawn_deadline();
        let result = self.run_phases().await;
        deadline.abort();
        result
    }

    async fn run_phases(&self) -> Result<RunReport> {
        let config = &self.config;

        tracing::debug!(
            repository = %config.repository,
            storage_namespace = %config.storage_namespace,
            "create repository for run"
        );
        self.remote
            .create_repository(
                &config.repository,
                &config.branch,
                &config.storage_namespace,
            )
            .await
            .with_context(|| {
                format!(
                    "failed to create repository '{}', storage '{}'",
                    config.repository, config.storage_namespace
                )
            })?;

        let pool = WorkerPool::new(config.parallelism_level, self.cancel.clone())
            .with_retry(self.retry);

        let template = ContentTemplate::generate(
            config.content_length,
            config.content_suffix_length,
            &mut rand::rng(),
        );
        let upload = Upload {
            remote: Arc::clone(&self.remote),
            repository: config.repository.clone(),
            branch: config.branch.clone(),
            template,
        };
        let upload = pool.run(Arc::new(upload), config.files_amount).await;
        tracing::info!(failed_count = upload.failed, "finished uploading files");

        let read = Read {
            remote: Arc::clone(&self.remote),
            repository: config.repository.clone(),
            reference: config.branch.clone(),
        };
        let read = pool.run(Arc::new(read), config.files_amount).await;
        tracing::info!(failed_count = read.failed, "finished reading files");

        Ok(RunReport {
            repository: config.repository.clone(),
            upload,
            read,
        })
    }

    /// Cancels the run once the global timeout has elapsed.
    fn spawn_deadline(&self) -> JoinHandle<()> {
        let cancel = self.cancel.clone();
        let timeout = self.config.global_timeout;

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    tracing::warn!(?timeout, "global timeout reached, cancelling run");
                    cancel.cancel();
                }
                _ = cancel.cancelled() => {}
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use reqwest::StatusCode;

    use super::*;
    use crate::error::{Error, Result};
    use crate::remote::Remote;

    /// An in-memory remote that fails every call for the configured paths.
    #[derive(Debug, Default)]
    struct MockRemote {
        failing: HashSet<String>,
        latency: Duration,
        repositories: Mutex<HashSet<String>>,
        objects: Mutex<HashMap<String, Bytes>>,
        attempts: Mutex<HashMap<(&'static str, String), u32>>,
    }

    impl MockRemote {
        fn failing(paths: &[&str]) -> Self {
            Self {
                failing: paths.iter().map(|p| p.to_string()).collect(),
                ..Default::default()
            }
        }

        fn attempts(&self, operation: &'static str, path: &str) -> u32 {
            let attempts = self.attempts.lock().unwrap();
            attempts
                .get(&(operation, path.to_owned()))
                .copied()
                .unwrap_or_default()
        }

        fn record(&self, operation: &'static str, path: &str) -> Result<()> {
            *self
                .attempts
                .lock()
                .unwrap()
                .entry((operation, path.to_owned()))
                .or_default() += 1;

            if self.failing.contains(path) {
                return Err(Error::Status {
                    context: format!("{operation} {path}"),
                    status: StatusCode::SERVICE_UNAVAILABLE,
                    body: "injected".into(),
                });
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl Remote for MockRemote {
        async fn create_repository(
            &self,
            name: &str,
            _default_branch: &str,
            _storage_namespace: &str,
        ) -> Result<String> {
            if !self.repositories.lock().unwrap().insert(name.to_owned()) {
                return Err(Error::Status {
                    context: format!("creating repository `{name}`"),
                    status: StatusCode::CONFLICT,
                    body: "repository already exists".into(),
                });
            }
            Ok(name.to_owned())
        }

        async fn upload_object(
            &self,
            _repository: &str,
            _branch: &str,
            path: &str,
            content: Bytes,
        ) -> Result<()> {
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            self.record("upload", path)?;
            self.objects
                .lock()
                .unwrap()
                .insert(path.to_owned(), content);
            Ok(())
        }

        async fn get_object(&self, _repository: &str, _reference: &str, path: &str) -> Result<Bytes> {
            self.record("get", path)?;
            self.objects
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .ok_or_else(|| Error::Status {
                    context: format!("reading {path}"),
                    status: StatusCode::NOT_FOUND,
                    body: String::new(),
                })
        }
    }

    fn config(workers: usize, files: u64) -> RunConfig {
        RunConfig {
            storage_namespace: "local://bench".into(),
            parallelism_level: workers,
            files_amount: files,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn counts_the_failing_file_in_both_phases() {
        repobench_test::tracing::init();
        let remote = Arc::new(MockRemote::failing(&["5"]));

        let report = BenchmarkDriver::new(remote.clone(), config(4, 10))
            .with_retry(RetryPolicy::immediate(3))
            .run()
            .await
            .unwrap();

        assert_eq!(report.repository, "testbenchmark");
        assert_eq!((report.upload.succeeded, report.upload.failed), (9, 1));
        assert_eq!((report.read.succeeded, report.read.failed), (9, 1));
        assert_eq!(remote.attempts("upload", "5"), 3);
        assert_eq!(remote.attempts("get", "5"), 3);
        assert_eq!(remote.attempts("upload", "4"), 1);
    }

    #[tokio::test]
    async fn uploads_unique_contents() {
        let remote = Arc::new(MockRemote::default());

        let report = BenchmarkDriver::new(remote.clone(), config(8, 200))
            .run()
            .await
            .unwrap();
        assert_eq!(report.upload.failed, 0);
        assert_eq!(report.read.failed, 0);

        let objects = remote.objects.lock().unwrap();
        assert_eq!(objects.len(), 200);
        assert!(objects.values().all(|content| content.len() == 1024));

        let prefixes: HashSet<_> = objects.values().map(|c| c.slice(..992)).collect();
        assert_eq!(prefixes.len(), 1);
        let contents: HashSet<_> = objects.values().collect();
        assert_eq!(contents.len(), 200);
    }

    #[tokio::test]
    async fn reading_twice_yields_no_failures() {
        let remote = Arc::new(MockRemote::default());
        let driver = BenchmarkDriver::new(remote.clone(), config(4, 50));
        driver.run().await.unwrap();

        let read = Arc::new(Read {
            remote,
            repository: "testbenchmark".into(),
            reference: "master".into(),
        });
        let pool = WorkerPool::new(4, CancellationToken::new());
        let report = pool.run(read, 50).await;

        assert_eq!(report.failed, 0);
        assert_eq!(report.succeeded, 50);
    }

    #[tokio::test]
    async fn setup_failure_aborts_the_run() {
        let remote = Arc::new(MockRemote::default());
        remote
            .repositories
            .lock()
            .unwrap()
            .insert("testbenchmark".into());

        let err = BenchmarkDriver::new(remote.clone(), config(4, 10))
            .run()
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "failed to create repository 'testbenchmark', storage 'local://bench'"
        );
        assert!(remote.objects.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn global_timeout_stops_the_run() {
        let remote = Arc::new(MockRemote {
            latency: Duration::from_secs(1),
            ..Default::default()
        });
        let config = RunConfig {
            global_timeout: Duration::from_millis(2500),
            ..config(1, 10)
        };

        let driver = BenchmarkDriver::new(remote.clone(), config);
        let report = driver.run().await.unwrap();

        assert!(driver.cancellation_token().is_cancelled());
        assert!(!report.upload.is_complete());
        assert!(report.upload.processed() >= 1);
        assert!(report.upload.processed() < 10);
        assert_eq!(report.read.processed(), 0);
    }

    #[tokio::test]
    async fn external_cancellation_skips_remaining_work() {
        let remote = Arc::new(MockRemote::default());
        let driver = BenchmarkDriver::new(remote, config(4, 1000));
        driver.cancellation_token().cancel();

        let report = driver.run().await.unwrap();

        assert_eq!(report.upload.processed(), 0);
        assert_eq!(report.read.processed(), 0);
    }
}
