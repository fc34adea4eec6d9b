//! Configuration for a benchmark run.
//!
//! Configuration can be loaded from multiple sources with the following precedence (highest to
//! lowest):
//!
//! 1. Environment variables (prefixed with `BENCHMARK_`)
//! 2. YAML configuration file (specified via `-c` or `--config` flag)
//! 3. Defaults
//!
//! See [`Config`] for a description of all configuration fields and their defaults.
//!
//! # Environment Variables
//!
//! Environment variables use `BENCHMARK_` as a prefix and double underscores (`__`) to denote
//! nested configuration structures. For example:
//!
//! - `BENCHMARK_ENDPOINT_URL=http://localhost:8000` sets the service endpoint
//! - `BENCHMARK_PARALLELISM_LEVEL=100` sets the number of workers
//! - `BENCHMARK_LOGGING__LEVEL=debug` sets the log level
//!
//! # YAML Configuration File
//!
//! The above configuration in YAML format would look like this:
//!
//! ```yaml
//! endpoint_url: http://localhost:8000
//! parallelism_level: 100
//!
//! logging:
//!   level: debug
//! ```

use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{Result, ensure};
use bytesize::ByteSize;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::driver::RunConfig;
use crate::metrics::SampleFilter;

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "BENCHMARK_";

/// Log output format.
///
/// Controls how log messages are formatted. The format can be explicitly specified or
/// auto-detected based on whether output is to a TTY.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum LogFormat {
    /// Auto detect the best format.
    ///
    /// This chooses [`LogFormat::Pretty`] for TTY, otherwise [`LogFormat::Simplified`].
    Auto,

    /// Pretty printing with colors.
    ///
    /// ```text
    ///  INFO  repobench::driver > finished uploading files
    /// ```
    Pretty,

    /// Simplified plain text output.
    ///
    /// ```text
    /// 2020-12-04T12:10:32Z [repobench::driver] INFO: finished uploading files
    /// ```
    Simplified,

    /// Dump out JSON lines.
    ///
    /// ```text
    /// {"timestamp":"2020-12-04T12:11:08.729716Z","level":"INFO","fields":{"message":"finished uploading files","failed_count":0},"target":"repobench::driver"}
    /// ```
    Json,
}

/// The logging format parse error.
#[derive(Clone, Debug)]
pub struct FormatParseError(String);

impl fmt::Display for FormatParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r#"error parsing "{}" as format: expected one of "auto", "pretty", "simplified", "json""#,
            self.0
        )
    }
}

impl std::str::FromStr for LogFormat {
    type Err = FormatParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let result = match s {
            "" => LogFormat::Auto,
            s if s.eq_ignore_ascii_case("auto") => LogFormat::Auto,
            s if s.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            s if s.eq_ignore_ascii_case("simplified") => LogFormat::Simplified,
            s if s.eq_ignore_ascii_case("json") => LogFormat::Json,
            s => return Err(FormatParseError(s.into())),
        };

        Ok(result)
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogFormat::Auto => "auto",
            LogFormat::Pretty => "pretty",
            LogFormat::Simplified => "simplified",
            LogFormat::Json => "json",
        })
    }
}

impl std::error::Error for FormatParseError {}

mod display_fromstr {
    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
        T: std::fmt::Display,
    {
        serializer.collect_str(&value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
        T: std::str::FromStr,
        <T as std::str::FromStr>::Err: std::fmt::Display,
    {
        use serde::Deserialize;
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Logging configuration.
///
/// Logs are always written to stderr, stdout is reserved for the report and the metric dump.
#[derive(Debug, Deserialize, Serialize)]
pub struct Logging {
    /// Minimum log level to output.
    ///
    /// The `RUST_LOG` environment variable provides more granular control per module if needed.
    ///
    /// # Default
    ///
    /// `INFO`
    ///
    /// # Environment Variable
    ///
    /// `BENCHMARK_LOGGING__LEVEL`
    #[serde(with = "display_fromstr")]
    pub level: LevelFilter,

    /// Log output format.
    ///
    /// # Default
    ///
    /// `Auto` (pretty for TTY, simplified otherwise)
    ///
    /// # Environment Variable
    ///
    /// `BENCHMARK_LOGGING__FORMAT`
    #[serde(with = "display_fromstr")]
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Main configuration of a benchmark run.
///
/// `endpoint_url` and `storage_namespace` have no defaults and must be provided.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// Base URL of the storage service.
    ///
    /// The API is expected below `/api/v1`, metrics are scraped from `/metrics`.
    ///
    /// # Environment Variable
    ///
    /// `BENCHMARK_ENDPOINT_URL`
    pub endpoint_url: String,

    /// Storage namespace of the created repository, for instance `s3://bucket/prefix`.
    ///
    /// # Environment Variable
    ///
    /// `BENCHMARK_STORAGE_NAMESPACE`
    pub storage_namespace: String,

    /// Number of concurrent workers per phase.
    ///
    /// # Default
    ///
    /// `500`
    ///
    /// # Environment Variable
    ///
    /// `BENCHMARK_PARALLELISM_LEVEL`
    pub parallelism_level: usize,

    /// Number of objects uploaded and read back.
    ///
    /// # Default
    ///
    /// `10000`
    ///
    /// # Environment Variable
    ///
    /// `BENCHMARK_FILES_AMOUNT`
    pub files_amount: u64,

    /// Deadline for the whole run, after which workers stop picking up new items.
    ///
    /// # Default
    ///
    /// `30m`
    ///
    /// # Environment Variable
    ///
    /// `BENCHMARK_GLOBAL_TIMEOUT`
    #[serde(with = "humantime_serde")]
    pub global_timeout: Duration,

    /// Name of the run, lower-cased to name the created repository.
    ///
    /// # Default
    ///
    /// `TestBenchmark`
    ///
    /// # Environment Variable
    ///
    /// `BENCHMARK_RUN_NAME`
    pub run_name: String,

    /// Branch to upload to and read from.
    ///
    /// # Default
    ///
    /// `master`
    pub branch: String,

    /// Size of every uploaded object.
    ///
    /// # Default
    ///
    /// `1 KiB`
    pub content_length: ByteSize,

    /// Number of trailing bytes of every object that are randomized per object.
    ///
    /// # Default
    ///
    /// `32`
    pub content_suffix_length: usize,

    /// Logging configuration.
    pub logging: Logging,

    /// Which samples to print from the post-run metrics scrape.
    pub metrics: SampleFilter,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint_url: String::new(),
            storage_namespace: String::new(),
            parallelism_level: 500,
            files_amount: 10_000,
            global_timeout: Duration::from_secs(30 * 60),
            run_name: "TestBenchmark".into(),
            branch: "master".into(),
            content_length: ByteSize::kib(1),
            content_suffix_length: 32,
            logging: Logging::default(),
            metrics: SampleFilter::default(),
        }
    }
}

impl Config {
    /// Loads configuration from the given YAML file and the environment.
    ///
    /// Configuration is merged in the following order (later sources override earlier ones):
    /// 1. Default values
    /// 2. YAML configuration file (if provided)
    /// 3. Environment variables (prefixed with `BENCHMARK_`)
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The YAML configuration file cannot be read or parsed
    /// - Environment variables contain invalid values
    /// - Required fields are missing or values are out of range
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = figment::Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config: Config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        ensure!(!self.endpoint_url.is_empty(), "`endpoint_url` is required");
        ensure!(
            !self.storage_namespace.is_empty(),
            "`storage_namespace` is required"
        );
        ensure!(
            self.parallelism_level >= 1,
            "`parallelism_level` must be at least 1"
        );
        ensure!(
            self.content_suffix_length as u64 <= self.content_length.as_u64(),
            "`content_suffix_length` ({}) exceeds `content_length` ({})",
            self.content_suffix_length,
            self.content_length,
        );
        Ok(())
    }

    /// The settings for the [`BenchmarkDriver`](crate::driver::BenchmarkDriver).
    pub fn run_config(&self) -> RunConfig {
        RunConfig {
            repository: self.run_name.to_lowercase(),
            storage_namespace: self.storage_namespace.clone(),
            branch: self.branch.clone(),
            parallelism_level: self.parallelism_level,
            files_amount: self.files_amount,
            global_timeout: self.global_timeout,
            content_length: self.content_length.as_u64() as usize,
            content_suffix_length: self.content_suffix_length,
        }
    }
}
