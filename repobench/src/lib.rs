//! A benchmark harness for a versioned object storage service.
//!
//! A run creates a fresh repository, uploads a configurable number of small objects into it with a
//! pool of concurrent workers, and then reads every object back. Each object operation is retried
//! with a linear backoff, and objects that still fail are counted without stopping the run. Once
//! the run is over, the [`MetricsScraper`] fetches the service's own request duration histograms
//! for the benchmarked operations.
//!
//! The building blocks can be used on their own:
//!
//! - [`RetryPolicy`] runs a fallible async operation a bounded number of times.
//! - [`queue::channel`] creates a bounded multi-consumer [`WorkQueue`].
//! - [`WorkerPool`] drains a queue of work items with a fixed number of workers.
//! - [`BenchmarkDriver`] wires all of them together against a [`Remote`].
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod config;
pub mod content;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod observability;
pub mod pool;
pub mod queue;
pub mod remote;
pub mod retry;

pub use crate::driver::{BenchmarkDriver, RunConfig, RunReport};
pub use crate::error::{Error, Result};
pub use crate::metrics::{MetricSample, MetricsScraper, SampleFilter};
pub use crate::pool::{Operation, PhaseReport, WorkerPool};
pub use crate::queue::{WorkItem, WorkQueue};
pub use crate::remote::{HttpRemote, Remote, SharedRemote};
pub use crate::retry::RetryPolicy;
