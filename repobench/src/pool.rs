//! Fans out a phase of work items over a fixed number of concurrent workers.

use std::fmt;
use std::ops::AddAssign;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::queue::{self, Producer, WorkItem, WorkQueue};
use crate::retry::RetryPolicy;

/// A per-item operation executed by every worker of a [`WorkerPool`].
///
/// Implementations are shared read-only among all workers, so any client they hold must be safe to
/// use concurrently.
#[async_trait::async_trait]
pub trait Operation: fmt::Debug + Send + Sync + 'static {
    /// Per-item state created once and shared by all attempts for that item.
    type Input: Send + Sync;

    /// The phase name, used in logs and reports.
    fn name(&self) -> &'static str;

    /// Creates the input for an item before its first attempt.
    fn prepare(&self, item: &WorkItem) -> Self::Input;

    /// Performs a single attempt of the operation for the given item.
    async fn execute(&self, item: &WorkItem, input: &Self::Input) -> Result<()>;
}

/// Outcome of running one phase through a [`WorkerPool`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhaseReport {
    /// Name of the phase, see [`Operation::name`].
    pub phase: &'static str,
    /// The number of work items the phase was started with.
    pub total: u64,
    /// Items whose operation eventually succeeded.
    pub succeeded: u64,
    /// Items whose operation failed on every attempt.
    pub failed: u64,
    /// Wall time from spawning the workers until the last one exited.
    pub elapsed: Duration,
}

impl PhaseReport {
    /// Number of items that were picked up by a worker.
    pub fn processed(&self) -> u64 {
        self.succeeded + self.failed
    }

    /// Whether every item was processed, i.e. the phase was not cut short by cancellation.
    pub fn is_complete(&self) -> bool {
        self.processed() == self.total
    }

    /// Processed items per second of wall time.
    pub fn ops_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.processed() as f64 / secs
        } else {
            0.0
        }
    }
}

/// Counts a single worker accumulates locally and hands back when it exits.
#[derive(Clone, Copy, Debug, Default)]
struct Tally {
    succeeded: u64,
    failed: u64,
}

impl AddAssign for Tally {
    fn add_assign(&mut self, rhs: Self) {
        self.succeeded += rhs.succeeded;
        self.failed += rhs.failed;
    }
}

/// Runs phases with a fixed number of concurrent workers.
///
/// Each call to [`run`](Self::run) spawns a fresh set of workers sharing one bounded
/// [`WorkQueue`] whose capacity equals the worker count. All workers are spawned before the first
/// item is produced. Once the queue is drained, or the cancellation token fires, the workers exit
/// and their local counts are summed into a [`PhaseReport`].
#[derive(Clone, Debug)]
pub struct WorkerPool {
    workers: usize,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Creates a pool of `workers` workers. A count of `0` is raised to `1`.
    pub fn new(workers: usize, cancel: CancellationToken) -> Self {
        Self {
            workers: workers.max(1),
            retry: RetryPolicy::default(),
            cancel,
        }
    }

    /// Replaces the default retry policy used for every item.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The number of workers spawned per phase.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Runs `operation` for the work items `1..=items` and waits for all workers to exit.
    pub async fn run<O: Operation>(&self, operation: Arc<O>, items: u64) -> PhaseReport {
        let start = Instant::now();
        let (producer, queue) = queue::channel(self.workers);

        let mut workers = JoinSet::new();
        for _ in 0..self.workers {
            workers.spawn(worker(
                Arc::clone(&operation),
                queue.clone(),
                self.retry,
                self.cancel.clone(),
            ));
        }
        // Only the workers hold the queue now, so the producer notices if they all exit early.
        drop(queue);

        produce(producer, items, &self.cancel).await;

        let mut tally = Tally::default();
        while let Some(result) = workers.join_next().await {
            match result {
                Ok(worker_tally) => tally += worker_tally,
                Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                // workers are never aborted
                Err(_) => {}
            }
        }

        PhaseReport {
            phase: operation.name(),
            total: items,
            succeeded: tally.succeeded,
            failed: tally.failed,
            elapsed: start.elapsed(),
        }
    }
}

/// Enqueues the work items `1..=items` in order, then closes the queue.
async fn produce(producer: Producer, items: u64, cancel: &CancellationToken) {
    for sequence in 1..=items {
        let item = WorkItem::from_sequence(sequence);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = producer.send(item) => {
                if result.is_err() {
                    break;
                }
            }
        }
    }
    producer.close();
}

async fn worker<O: Operation>(
    operation: Arc<O>,
    queue: WorkQueue,
    retry: RetryPolicy,
    cancel: CancellationToken,
) -> Tally {
    let mut tally = Tally::default();

    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            item = queue.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        let input = operation.prepare(&item);
        match retry.run(|| operation.execute(&item, &input)).await {
            Ok(()) => tally.succeeded += 1,
            Err(error) => {
                tally.failed += 1;
                tracing::error!(
                    file_num = %item,
                    phase = operation.name(),
                    error = &error as &dyn std::error::Error,
                    "failed processing file"
                );
            }
        }
    }

    tally
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use reqwest::StatusCode;

    use super::*;
    use crate::error::Error;

    /// Records every attempt and fails all attempts for the configured paths.
    #[derive(Debug, Default)]
    struct Recording {
        failing: Vec<&'static str>,
        attempts: Mutex<HashMap<String, u32>>,
    }

    impl Recording {
        fn failing(paths: &[&'static str]) -> Self {
            Self {
                failing: paths.to_vec(),
                ..Default::default()
            }
        }

        fn attempts(&self) -> HashMap<String, u32> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Operation for Recording {
        type Input = ();

        fn name(&self) -> &'static str {
            "record"
        }

        fn prepare(&self, _item: &WorkItem) {}

        async fn execute(&self, item: &WorkItem, _input: &()) -> Result<()> {
            *self
                .attempts
                .lock()
                .unwrap()
                .entry(item.to_string())
                .or_default() += 1;

            if self.failing.contains(&item.as_str()) {
                return Err(Error::Status {
                    context: format!("processing {item}"),
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    body: String::new(),
                });
            }
            Ok(())
        }
    }

    /// Cancels the run while processing the configured item.
    #[derive(Debug)]
    struct CancelAt {
        item: &'static str,
        cancel: CancellationToken,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl Operation for CancelAt {
        type Input = ();

        fn name(&self) -> &'static str {
            "cancel"
        }

        fn prepare(&self, _item: &WorkItem) {}

        async fn execute(&self, item: &WorkItem, _input: &()) -> Result<()> {
            self.seen.lock().unwrap().push(item.to_string());
            if item.as_str() == self.item {
                self.cancel.cancel();
            }
            Ok(())
        }
    }

    fn pool(workers: usize) -> WorkerPool {
        WorkerPool::new(workers, CancellationToken::new()).with_retry(RetryPolicy::immediate(3))
    }

    #[tokio::test]
    async fn processes_every_item_exactly_once() {
        for (workers, items) in [(1, 0), (1, 7), (3, 1), (4, 10), (16, 200)] {
            let operation = Arc::new(Recording::default());

            let report = pool(workers).run(Arc::clone(&operation), items).await;

            assert_eq!(report.total, items);
            assert_eq!(report.succeeded, items);
            assert_eq!(report.failed, 0);
            assert!(report.is_complete());

            let attempts = operation.attempts();
            assert_eq!(attempts.len() as u64, items);
            assert!(attempts.values().all(|count| *count == 1));
            for sequence in 1..=items {
                assert!(attempts.contains_key(&sequence.to_string()));
            }
        }
    }

    #[tokio::test]
    async fn counts_a_terminal_failure_once() {
        repobench_test::tracing::init();
        let operation = Arc::new(Recording::failing(&["5"]));

        let report = pool(4).run(Arc::clone(&operation), 10).await;

        assert_eq!(report.phase, "record");
        assert_eq!(report.failed, 1);
        assert_eq!(report.succeeded, 9);
        assert_eq!(report.processed(), 10);

        let attempts = operation.attempts();
        assert_eq!(attempts["5"], 3);
        assert!(
            attempts
                .iter()
                .filter(|(path, _)| path.as_str() != "5")
                .all(|(_, count)| *count == 1)
        );
    }

    #[tokio::test]
    async fn logs_one_event_per_terminal_failure() {
        let logs = Arc::new(Mutex::new(Vec::<u8>::new()));
        let writer = Arc::clone(&logs);
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || LogWriter(Arc::clone(&writer)))
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let operation = Arc::new(Recording::failing(&["5"]));
        let report = pool(4).run(Arc::clone(&operation), 10).await;
        assert_eq!(report.failed, 1);
        assert_eq!(operation.attempts()["5"], 3);

        let logs = String::from_utf8(logs.lock().unwrap().clone()).unwrap();
        let failures: Vec<_> = logs
            .lines()
            .filter(|line| line.contains("failed processing file"))
            .collect();
        assert_eq!(failures.len(), 1, "{logs}");
        assert!(failures[0].contains("ERROR"), "{logs}");
        assert!(failures[0].contains("file_num=5"), "{logs}");
        assert!(failures[0].contains(r#"phase="record""#), "{logs}");
    }

    /// Collects formatted log output in memory.
    struct LogWriter(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn failures_do_not_stop_other_workers() {
        let operation = Arc::new(Recording::failing(&["1", "2", "3", "4"]));

        let report = pool(2).run(operation, 50).await;

        assert_eq!(report.failed, 4);
        assert_eq!(report.succeeded, 46);
    }

    #[tokio::test]
    async fn stops_picking_up_items_after_cancellation() {
        let cancel = CancellationToken::new();
        let operation = Arc::new(CancelAt {
            item: "7",
            cancel: cancel.clone(),
            seen: Mutex::default(),
        });

        let report = WorkerPool::new(1, cancel.clone())
            .with_retry(RetryPolicy::immediate(3))
            .run(Arc::clone(&operation), 10)
            .await;

        assert!(cancel.is_cancelled());
        assert!(!report.is_complete());
        assert_eq!(report.processed(), 7);
        assert_eq!(
            *operation.seen.lock().unwrap(),
            ["1", "2", "3", "4", "5", "6", "7"]
        );
    }

    #[tokio::test]
    async fn cancelled_before_start_processes_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = WorkerPool::new(8, cancel)
            .run(Arc::new(Recording::default()), 100)
            .await;

        assert_eq!(report.processed(), 0);
        assert_eq!(report.total, 100);
    }

    #[tokio::test]
    async fn small_queue_keeps_the_producer_moving() {
        let operation = Arc::new(Recording::default());

        let report = tokio::time::timeout(Duration::from_secs(10), pool(5).run(operation, 1000))
            .await
            .expect("phase should not stall");

        assert_eq!(report.succeeded, 1000);
    }

    #[test]
    fn zero_workers_are_raised_to_one() {
        assert_eq!(WorkerPool::new(0, CancellationToken::new()).workers(), 1);
    }
}
