//! Runs a benchmark against a storage service and prints its results.
//!
//! Settings are read from an optional YAML file and `BENCHMARK_` environment variables, see
//! [`Config`] for the available keys.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use argh::FromArgs;

use repobench::config::Config;
use repobench::observability;
use repobench::{BenchmarkDriver, HttpRemote, MetricsScraper};

/// Benchmark for a versioned object storage service
#[derive(Debug, FromArgs)]
pub struct Args {
    /// path to the yaml configuration file
    #[argh(option, short = 'c')]
    pub config: Option<PathBuf>,

    /// do not scrape the service metrics after the run
    #[argh(switch)]
    pub skip_metrics: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = argh::from_env();

    let config = Config::load(args.config.as_deref()).context("failed to load configuration")?;
    observability::init_tracing(&config.logging);
    tracing::debug!(?config, "loaded configuration");

    let remote = HttpRemote::new(&config.endpoint_url)?;
    let driver = BenchmarkDriver::new(Arc::new(remote), config.run_config());

    let cancel = driver.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("received interrupt, stopping workers");
            cancel.cancel();
        }
    });

    let result = driver.run().await;
    match &result {
        Ok(report) => report.print(),
        Err(error) => {
            tracing::error!(error = &**error as &dyn std::error::Error, "benchmark failed")
        }
    }

    let scraped = if args.skip_metrics {
        Ok(())
    } else {
        print_metrics(&config).await
    };

    exit_status(result.map(|_| ()), scraped)
}

async fn print_metrics(config: &Config) -> anyhow::Result<()> {
    let scraper = MetricsScraper::new(&config.endpoint_url, config.metrics.clone())?;
    let samples = scraper
        .scrape()
        .await
        .with_context(|| format!("failed to scrape metrics from {}", scraper.url()))?;

    println!();
    for sample in &samples {
        println!("{sample:?}");
    }
    Ok(())
}

/// Returns the error of a failed run, or else the error of a failed scrape.
///
/// If both failed, the scrape error is only logged.
fn exit_status(run: anyhow::Result<()>, scrape: anyhow::Result<()>) -> anyhow::Result<()> {
    match (run, scrape) {
        (Err(run), Err(scrape)) => {
            tracing::error!(
                error = &*scrape as &dyn std::error::Error,
                "failed to scrape metrics"
            );
            Err(run)
        }
        (run, scrape) => run.and(scrape),
    }
}
