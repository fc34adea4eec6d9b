//! Scrapes the storage service's metrics endpoint after a benchmark run.
//!
//! The harness computes no latency statistics of its own. Instead, the service's request duration
//! histograms for the benchmarked operations are fetched once the run is over and passed through
//! verbatim as [`MetricSample`]s.

use std::collections::BTreeSet;

use prometheus_parse::{Sample, Scrape, Value};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::remote::{USER_AGENT, check_status};

/// Selects which metrics to keep from a scrape.
///
/// A metric is kept if its family is named [`family`](Self::family) and the value of its
/// [`label`](Self::label) is one of [`values`](Self::values).
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SampleFilter {
    /// Name of the metric family.
    ///
    /// # Default
    ///
    /// `api_request_duration_seconds`
    pub family: String,

    /// Name of the label identifying the API operation.
    ///
    /// # Default
    ///
    /// `operation`
    pub label: String,

    /// The monitored operations.
    ///
    /// # Default
    ///
    /// `getObject` and `uploadObject`, the operations issued by the read and upload phases.
    pub values: BTreeSet<String>,
}

impl Default for SampleFilter {
    fn default() -> Self {
        Self {
            family: "api_request_duration_seconds".into(),
            label: "operation".into(),
            values: ["getObject", "uploadObject"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl SampleFilter {
    /// Whether the given sample passes this filter.
    pub fn matches(&self, sample: &Sample) -> bool {
        family_name(sample) == self.family
            && sample
                .labels
                .get(&self.label)
                .is_some_and(|value| self.values.contains(&value[..]))
    }

    /// Extracts all matching samples from a scrape, ordered by their operation label.
    pub fn select(&self, scrape: Scrape) -> Vec<MetricSample> {
        let mut samples: Vec<_> = scrape
            .samples
            .into_iter()
            .filter(|sample| self.matches(sample))
            .map(|sample| MetricSample {
                family: family_name(&sample).to_owned(),
                sample,
            })
            .collect();

        samples.sort_by(|a, b| a.operation(&self.label).cmp(&b.operation(&self.label)));
        samples
    }
}

/// The family name of a sample. Histogram samples carry the name of their `_bucket` series.
fn family_name(sample: &Sample) -> &str {
    match sample.value {
        Value::Histogram(_) => sample
            .metric
            .strip_suffix("_bucket")
            .unwrap_or(sample.metric.as_str()),
        _ => sample.metric.as_str(),
    }
}

/// A single sample selected from a scrape, printed as-is.
#[derive(Debug)]
pub struct MetricSample {
    /// The family the sample belongs to.
    pub family: String,
    /// Labels and value as parsed from the exposition.
    pub sample: Sample,
}

impl MetricSample {
    /// The value of the label the sample was selected by, if present.
    pub fn operation(&self, label: &str) -> Option<&str> {
        self.sample.labels.get(label).map(|value| &value[..])
    }

    /// Total number of observations of a histogram, taken from its `+Inf` bucket.
    pub fn observations(&self) -> Option<f64> {
        match &self.sample.value {
            Value::Histogram(buckets) => buckets
                .iter()
                .find(|bucket| bucket.less_than.is_infinite())
                .map(|bucket| bucket.count),
            _ => None,
        }
    }
}

/// Parses a Prometheus text exposition.
pub fn parse(text: &str) -> Result<Scrape> {
    let lines = text.lines().map(|line| Ok::<_, std::io::Error>(line.to_owned()));
    Scrape::parse(lines).map_err(|cause| Error::Parse { cause })
}

/// Fetches and filters the metrics exposed at `{endpoint}/metrics`.
#[derive(Clone, Debug)]
pub struct MetricsScraper {
    url: Url,
    filter: SampleFilter,
    client: reqwest::Client,
}

impl MetricsScraper {
    /// Creates a scraper for the service at `endpoint`.
    pub fn new(endpoint: &str, filter: SampleFilter) -> Result<Self> {
        let mut url = Url::parse(endpoint).map_err(|err| Error::InvalidUrl {
            message: format!("invalid endpoint URL `{endpoint}`: {err}"),
        })?;
        url.path_segments_mut()
            .map_err(|()| Error::InvalidUrl {
                message: format!("endpoint URL `{endpoint}` cannot have a path"),
            })?
            .pop_if_empty()
            .push("metrics");

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|cause| Error::reqwest("building HTTP client", cause))?;

        Ok(Self {
            url,
            filter,
            client,
        })
    }

    /// The URL that is scraped.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Issues a single request to the metrics endpoint and returns the matching samples.
    pub async fn scrape(&self) -> Result<Vec<MetricSample>> {
        let context = || format!("scraping {}", self.url);

        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(|cause| Error::reqwest(context(), cause))?;
        let text = check_status(response, context)
            .await?
            .text()
            .await
            .map_err(|cause| Error::reqwest(context(), cause))?;

        let samples = self.filter.select(parse(&text)?);
        tracing::debug!(samples = samples.len(), url = %self.url, "scraped metrics");

        Ok(samples)
    }
}
