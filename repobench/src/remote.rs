//! Contains the [`Remote`] abstraction of the storage service and its HTTP implementation.

use std::fmt::Debug;

use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::{Response, Url};
use serde::Deserialize;

use crate::error::{Error, Result};

/// User agent string used for outgoing requests.
pub const USER_AGENT: &str = concat!("repobench/", env!("CARGO_PKG_VERSION"));

/// Path segments of the versioned API below the service endpoint.
const API_PREFIX: [&str; 2] = ["api", "v1"];

/// A type-erased [`Remote`] instance, shared by all workers of a run.
pub type SharedRemote = std::sync::Arc<dyn Remote>;

/// The operations of the storage service that the benchmark exercises.
///
/// Calls are stateless, so a single instance is shared read-only among all workers.
#[async_trait::async_trait]
pub trait Remote: Debug + Send + Sync + 'static {
    /// Creates a repository and returns its identifier.
    async fn create_repository(
        &self,
        name: &str,
        default_branch: &str,
        storage_namespace: &str,
    ) -> Result<String>;

    /// Uploads `content` to `path` on the given branch.
    async fn upload_object(
        &self,
        repository: &str,
        branch: &str,
        path: &str,
        content: Bytes,
    ) -> Result<()>;

    /// Fetches the object at `path` as of the given ref.
    async fn get_object(&self, repository: &str, reference: &str, path: &str) -> Result<Bytes>;
}

#[derive(Debug, Deserialize)]
struct RepositoryResponse {
    id: String,
}

/// A remote implementation using HTTP to interact with the storage service.
#[derive(Clone, Debug)]
pub struct HttpRemote {
    endpoint: Url,
    client: reqwest::Client,
}

impl HttpRemote {
    /// Creates a new `HttpRemote` for the service at `endpoint` with a default client.
    pub fn new(endpoint: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|cause| Error::reqwest("building HTTP client", cause))?;

        Self::with_client(endpoint, client)
    }

    /// Creates a new `HttpRemote` using the given client.
    pub fn with_client(endpoint: &str, client: reqwest::Client) -> Result<Self> {
        let endpoint = Url::parse(endpoint).map_err(|err| Error::InvalidUrl {
            message: format!("invalid endpoint URL `{endpoint}`: {err}"),
        })?;
        if endpoint.cannot_be_a_base() {
            return Err(Error::InvalidUrl {
                message: format!("endpoint URL `{endpoint}` cannot have a path"),
            });
        }

        Ok(Self { endpoint, client })
    }

    /// The endpoint this remote talks to.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn api_url(&self, segments: &[&str]) -> Url {
        let mut url = self.endpoint.clone();
        // checked in the constructor
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(API_PREFIX).extend(segments);
        }
        url
    }
}

#[async_trait::async_trait]
impl Remote for HttpRemote {
    async fn create_repository(
        &self,
        name: &str,
        default_branch: &str,
        storage_namespace: &str,
    ) -> Result<String> {
        let context = || format!("creating repository `{name}`");

        let body = serde_json::json!({
            "name": name,
            "storage_namespace": storage_namespace,
            "default_branch": default_branch,
        });
        let response = self
            .client
            .post(self.api_url(&["repositories"]))
            .json(&body)
            .send()
            .await
            .map_err(|cause| Error::reqwest(context(), cause))?;

        let repository: RepositoryResponse = check_status(response, context)
            .await?
            .json()
            .await
            .map_err(|cause| Error::reqwest(context(), cause))?;

        Ok(repository.id)
    }

    async fn upload_object(
        &self,
        repository: &str,
        branch: &str,
        path: &str,
        content: Bytes,
    ) -> Result<()> {
        let context = || format!("uploading `{path}` to {repository}/{branch}");

        let len = content.len() as u64;
        let form = Form::new().part(
            "content",
            Part::stream_with_length(content, len).file_name(path.to_owned()),
        );
        let response = self
            .client
            .post(self.api_url(&["repositories", repository, "branches", branch, "objects"]))
            .query(&[("path", path)])
            .multipart(form)
            .send()
            .await
            .map_err(|cause| Error::reqwest(context(), cause))?;

        check_status(response, context).await?;
        Ok(())
    }

    async fn get_object(&self, repository: &str, reference: &str, path: &str) -> Result<Bytes> {
        let context = || format!("reading `{path}` from {repository}@{reference}");

        let response = self
            .client
            .get(self.api_url(&["repositories", repository, "refs", reference, "objects"]))
            .query(&[("path", path)])
            .send()
            .await
            .map_err(|cause| Error::reqwest(context(), cause))?;

        check_status(response, context)
            .await?
            .bytes()
            .await
            .map_err(|cause| Error::reqwest(context(), cause))
    }
}

/// Turns non-success responses into [`Error::Status`], keeping the response body for diagnostics.
pub(crate) async fn check_status(
    response: Response,
    context: impl FnOnce() -> String,
) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(Error::Status {
        context: context(),
        status,
        body,
    })
}
