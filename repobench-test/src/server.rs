//! Exposes an in-process mock of the storage service for use in integration tests.
//!
//! ```
//! use repobench_test::server::TestServer;
//!
//! #[tokio::main]
//! async fn main() {
//!    let server = TestServer::builder().fail_path("5").start().await;
//!    let url = server.url("/api/v1/repositories");
//!    // use the URL in tests...
//! }
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write as _;
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};

use axum::extract::{Multipart, Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;

/// Operation label of repository creation in the request duration histogram.
pub const CREATE_REPOSITORY: &str = "createRepository";
/// Operation label of object uploads.
pub const UPLOAD_OBJECT: &str = "uploadObject";
/// Operation label of object reads.
pub const GET_OBJECT: &str = "getObject";

#[derive(Debug, Default)]
struct Inner {
    failing: HashSet<String>,
    repositories: Mutex<BTreeMap<String, String>>,
    objects: Mutex<HashMap<(String, String), Bytes>>,
    requests: Mutex<HashMap<(&'static str, String), u32>>,
}

type ServerState = Arc<Inner>;

impl Inner {
    /// Counts a request and tells whether it should fail.
    fn record(&self, operation: &'static str, path: &str) -> bool {
        *self
            .requests
            .lock()
            .unwrap()
            .entry((operation, path.to_owned()))
            .or_default() += 1;
        self.failing.contains(path)
    }

    fn operation_count(&self, operation: &str) -> u32 {
        let requests = self.requests.lock().unwrap();
        requests
            .iter()
            .filter(|((op, _), _)| *op == operation)
            .map(|(_, count)| count)
            .sum()
    }
}

/// Configures a [`TestServer`] before starting it.
#[derive(Debug, Default)]
pub struct TestServerBuilder {
    failing: HashSet<String>,
}

impl TestServerBuilder {
    /// Makes every upload and read of the object at `path` fail with `503 Service Unavailable`.
    pub fn fail_path(mut self, path: impl Into<String>) -> Self {
        self.failing.insert(path.into());
        self
    }

    /// Binds to a random port on localhost and starts serving.
    pub async fn start(self) -> TestServer {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let state = Arc::new(Inner {
            failing: self.failing,
            ..Default::default()
        });
        let app = router(state.clone());

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, app).await.unwrap();
        });

        TestServer {
            handle,
            socket,
            state,
        }
    }
}

/// An in-process mock of the storage service for use in integration tests.
///
/// The server keeps repositories and objects in memory and exposes request duration histograms
/// at `/metrics`. It listens on a random available port on localhost and stops when dropped.
#[derive(Debug)]
pub struct TestServer {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
    state: ServerState,
}

impl TestServer {
    /// Starts a server where all requests succeed.
    pub async fn new() -> Self {
        Self::builder().start().await
    }

    /// Returns a builder to inject failures.
    pub fn builder() -> TestServerBuilder {
        TestServerBuilder::default()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.socket.port(), path)
    }

    /// Returns how often `operation` was requested for the object at `path`.
    pub fn requests(&self, operation: &str, path: &str) -> u32 {
        let requests = self.state.requests.lock().unwrap();
        requests
            .iter()
            .filter(|((op, p), _)| *op == operation && p == path)
            .map(|(_, count)| *count)
            .sum()
    }

    /// Returns the storage namespace of the repository, if it exists.
    pub fn repository(&self, name: &str) -> Option<String> {
        self.state.repositories.lock().unwrap().get(name).cloned()
    }

    /// Returns the contents of a stored object.
    pub fn object(&self, repository: &str, path: &str) -> Option<Bytes> {
        let objects = self.state.objects.lock().unwrap();
        objects
            .get(&(repository.to_owned(), path.to_owned()))
            .cloned()
    }

    /// Returns the number of objects stored in the repository.
    pub fn object_count(&self, repository: &str) -> usize {
        let objects = self.state.objects.lock().unwrap();
        objects.keys().filter(|(repo, _)| repo == repository).count()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn router(state: ServerState) -> Router {
    Router::new()
        .route("/api/v1/repositories", post(create_repository))
        .route(
            "/api/v1/repositories/{repository}/branches/{branch}/objects",
            post(upload_object),
        )
        .route(
            "/api/v1/repositories/{repository}/refs/{reference}/objects",
            get(get_object),
        )
        .route("/metrics", get(metrics))
        .with_state(state)
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "message": message.into() }))).into_response()
}

#[derive(Debug, Deserialize)]
struct CreateRepository {
    name: String,
    storage_namespace: String,
    #[serde(default)]
    default_branch: Option<String>,
}

async fn create_repository(
    State(state): State<ServerState>,
    Json(request): Json<CreateRepository>,
) -> Response {
    state.record(CREATE_REPOSITORY, "");

    let mut repositories = state.repositories.lock().unwrap();
    if repositories.contains_key(&request.name) {
        return error(StatusCode::CONFLICT, "repository already exists");
    }
    repositories.insert(request.name.clone(), request.storage_namespace.clone());

    let body = json!({
        "id": request.name,
        "storage_namespace": request.storage_namespace,
        "default_branch": request.default_branch.unwrap_or_else(|| "main".into()),
        "creation_date": 0,
    });
    (StatusCode::CREATED, Json(body)).into_response()
}

#[derive(Debug, Deserialize)]
struct ObjectQuery {
    path: String,
}

async fn upload_object(
    State(state): State<ServerState>,
    Path((repository, _branch)): Path<(String, String)>,
    Query(query): Query<ObjectQuery>,
    mut multipart: Multipart,
) -> Response {
    if state.record(UPLOAD_OBJECT, &query.path) {
        return error(StatusCode::SERVICE_UNAVAILABLE, "injected failure");
    }
    if !state.repositories.lock().unwrap().contains_key(&repository) {
        return error(StatusCode::NOT_FOUND, "repository not found");
    }

    let mut content = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) if field.name() == Some("content") => match field.bytes().await {
                Ok(bytes) => content = Some(bytes),
                Err(err) => return err.into_response(),
            },
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(err) => return err.into_response(),
        }
    }
    let Some(content) = content else {
        return error(StatusCode::BAD_REQUEST, "missing `content` part");
    };

    let size = content.len();
    state
        .objects
        .lock()
        .unwrap()
        .insert((repository, query.path.clone()), content);

    let body = json!({ "path": query.path, "size_bytes": size });
    (StatusCode::CREATED, Json(body)).into_response()
}

async fn get_object(
    State(state): State<ServerState>,
    Path((repository, _reference)): Path<(String, String)>,
    Query(query): Query<ObjectQuery>,
) -> Response {
    if state.record(GET_OBJECT, &query.path) {
        return error(StatusCode::SERVICE_UNAVAILABLE, "injected failure");
    }

    let objects = state.objects.lock().unwrap();
    match objects.get(&(repository, query.path)) {
        Some(content) => content.clone().into_response(),
        None => error(StatusCode::NOT_FOUND, "object not found"),
    }
}

/// Renders a request duration histogram per operation, assuming every request took 1ms.
async fn metrics(State(state): State<ServerState>) -> Response {
    let mut text = String::new();
    text.push_str("# HELP api_request_duration_seconds request durations for the API\n");
    text.push_str("# TYPE api_request_duration_seconds histogram\n");
    for operation in [CREATE_REPOSITORY, GET_OBJECT, UPLOAD_OBJECT] {
        let count = state.operation_count(operation);
        for le in ["0.005", "0.1", "+Inf"] {
            writeln!(
                text,
                "api_request_duration_seconds_bucket{{operation=\"{operation}\",le=\"{le}\"}} {count}"
            )
            .unwrap();
        }
        writeln!(
            text,
            "api_request_duration_seconds_sum{{operation=\"{operation}\"}} {}",
            f64::from(count) * 0.001
        )
        .unwrap();
        writeln!(
            text,
            "api_request_duration_seconds_count{{operation=\"{operation}\"}} {count}"
        )
        .unwrap();
    }

    text.push_str("# HELP go_goroutines Number of goroutines that currently exist.\n");
    text.push_str("# TYPE go_goroutines gauge\n");
    text.push_str("go_goroutines 42\n");

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        text,
    )
        .into_response()
}
