//! Helpers for testing the connector against a real HTTP server.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Hold on to the [`MockApi`] until all requests to it have been made. Dropping it stops the
//!    server, and all connections to it will fail.

use std::collections::{BTreeMap, HashMap};
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;
use url::Url;

/// The path prefix the mock API is served under, like the versioned production API.
pub const API_PREFIX: &str = "/0.1/";

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the connector crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("communibase_connector=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    pub fn with_router(router: Router) -> Self {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A request received by the [`MockApi`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub method: String,
    /// The path relative to the API prefix, e.g. `Person.json/crud`.
    pub path: String,
    pub query: Option<String>,
    /// Header values by lowercase header name.
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone)]
struct MockResponse {
    status: StatusCode,
    content_type: &'static str,
    body: Bytes,
}

#[derive(Debug, Default)]
struct MockState {
    responses: Mutex<HashMap<(String, String), MockResponse>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

/// A scripted stand-in for the Communibase API.
///
/// Every request is recorded. Requests are answered with the response registered for their
/// method and path, or with a `404` JSON error body if there is none.
#[derive(Debug)]
pub struct MockApi {
    server: Server,
    state: Arc<MockState>,
}

impl MockApi {
    pub fn new() -> Self {
        let state = Arc::new(MockState::default());
        let router = Router::new()
            .fallback(handle_request)
            .with_state(Arc::clone(&state));
        let server = Server::with_router(router);

        Self { server, state }
    }

    /// The base URL to configure the connector with.
    pub fn service_url(&self) -> Url {
        self.server.url(API_PREFIX)
    }

    /// Answers `method` requests to `path` with a JSON body.
    pub fn respond(&self, method: &str, path: &str, status: u16, body: Value) {
        self.register(
            method,
            path,
            MockResponse {
                status: StatusCode::from_u16(status).unwrap(),
                content_type: "application/json",
                body: Bytes::from(body.to_string()),
            },
        );
    }

    /// Answers `GET` requests to `path` with raw bytes.
    pub fn respond_bytes(&self, path: &str, status: u16, body: impl Into<Bytes>) {
        self.register(
            "GET",
            path,
            MockResponse {
                status: StatusCode::from_u16(status).unwrap(),
                content_type: "application/octet-stream",
                body: body.into(),
            },
        );
    }

    fn register(&self, method: &str, path: &str, response: MockResponse) {
        let path = path.trim_start_matches('/').to_owned();
        self.state
            .responses
            .lock()
            .unwrap()
            .insert((method.to_uppercase(), path), response);
    }

    /// Returns all requests received so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    /// Returns the number of requests received so far.
    pub fn accesses(&self) -> usize {
        self.state.requests.lock().unwrap().len()
    }
}

impl Default for MockApi {
    fn default() -> Self {
        Self::new()
    }
}

async fn handle_request(
    State(state): State<Arc<MockState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri
        .path()
        .strip_prefix(API_PREFIX)
        .unwrap_or(uri.path())
        .to_owned();

    let request = RecordedRequest {
        method: method.to_string(),
        path: path.clone(),
        query: uri.query().map(str::to_owned),
        headers: headers
            .iter()
            .filter_map(|(name, value)| Some((name.to_string(), value.to_str().ok()?.to_owned())))
            .collect(),
        body: serde_json::from_slice(&body).ok(),
    };
    state.requests.lock().unwrap().push(request);

    let response = state
        .responses
        .lock()
        .unwrap()
        .get(&(method.to_string(), path.clone()))
        .cloned();

    match response {
        Some(response) => (
            response.status,
            [(header::CONTENT_TYPE, response.content_type)],
            response.body,
        )
            .into_response(),
        None => {
            let body = json!({
                "code": 404,
                "message": format!("no mock response for {method} {path}"),
            });
            (
                StatusCode::NOT_FOUND,
                [(header::CONTENT_TYPE, "application/json")],
                body.to_string(),
            )
                .into_response()
        }
    }
}
