//! Helpers for testing the proxy and its caching engine.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that
//!    all console output is captured by the test runner.
//!
//!  - When using [`tempdir`], hold the handle for the entire lifetime of
//!    the test (`let _cache_dir = tempdir();`), otherwise the directory is
//!    removed while the cache still points at it.
//!
//!  - Hold the [`Server`] until all requests against it have been made;
//!    dropping it aborts the listener and pending connections time out.

use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{self, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{middleware, Router};
use tower_http::trace::TraceLayer;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;
use url::Url;

pub use tempfile::TempDir;

/// Setup the test environment: a tracing subscriber that only captures
/// proxpi's own logs and writes through the test runner.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("proxpi=trace,tower_http=debug"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory, deleted when the guard is dropped.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// One artifact served by the fixture index.
#[derive(Debug, Clone)]
pub struct FixtureFile {
    pub filename: String,
    pub content: Vec<u8>,
    pub sha256: Option<String>,
    pub requires_python: Option<String>,
}

impl FixtureFile {
    pub fn new(filename: &str, content: &[u8]) -> Self {
        FixtureFile {
            filename: filename.to_owned(),
            content: content.to_vec(),
            sha256: None,
            requires_python: None,
        }
    }

    pub fn with_sha256(mut self, digest: &str) -> Self {
        self.sha256 = Some(digest.to_owned());
        self
    }

    pub fn with_requires_python(mut self, spec: &str) -> Self {
        self.requires_python = Some(spec.to_owned());
        self
    }
}

/// The listing format the fixture index responds with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixtureFormat {
    Html,
    Json,
}

#[derive(Debug)]
struct FixtureState {
    /// Display name to files, in insertion order.
    projects: Vec<(String, Vec<FixtureFile>)>,
    format: FixtureFormat,
    /// When set, every index route answers with this status instead.
    failing: Option<StatusCode>,
    /// When set, listing hrefs detour through the delay route, making
    /// every file download take this long.
    file_delay: Option<Duration>,
}

#[derive(Debug, Clone)]
struct Fixture {
    state: Arc<Mutex<FixtureState>>,
}

/// A test server that binds to a random port and serves a configurable
/// simple-repository index.
///
/// The server counts every request by URI, to be read via [`accesses`]
/// (Self::accesses) or [`hits`](Self::hits). Besides the index routes it
/// serves:
///
/// - `/files/{project}/{filename}` — artifact bytes.
/// - `/delay/{time}/{*path}` — sleeps for `time`, then redirects to `/path`.
/// - `/respond_statuscode/{num}` — responds with the given status code.
///
/// Requires a `tokio` runtime and stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
    fixture: Fixture,
}

impl Server {
    /// Creates a server with an empty HTML-format index.
    pub fn new() -> Self {
        let fixture = Fixture {
            state: Arc::new(Mutex::new(FixtureState {
                projects: Vec::new(),
                format: FixtureFormat::Html,
                failing: None,
                file_delay: None,
            })),
        };
        let hits = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = hits.clone();
            move |extract::OriginalUri(uri): extract::OriginalUri, req, next: middleware::Next| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        *hits.entry(uri.path().to_string()).or_default() += 1;
                    }
                    next.run(req).await
                }
            }
        };

        let router = Router::new()
            .route("/simple/", get(root_listing))
            .route("/simple/{project}/", get(project_listing))
            .route("/files/{project}/{filename}", get(serve_file))
            .route(
                "/delay/{time}/{*path}",
                get(
                    |extract::Path((time, path)): extract::Path<(String, String)>| async move {
                        let duration = humantime::parse_duration(&time).unwrap();
                        tokio::time::sleep(duration).await;
                        (StatusCode::FOUND, [("Location", format!("/{path}"))])
                    },
                ),
            )
            .route(
                "/respond_statuscode/{num}",
                get(|extract::Path(num): extract::Path<u16>| async move {
                    StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                }),
            )
            .with_state(fixture.clone())
            .layer(middleware::from_fn(hitcounter))
            .layer(TraceLayer::new_for_http());

        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            handle,
            socket,
            hits,
            fixture,
        }
    }

    /// Adds (or replaces) a project and its files, under `display` name.
    pub fn set_project(&self, display: &str, files: Vec<FixtureFile>) {
        let mut state = self.fixture.state.lock().unwrap();
        if let Some(slot) = state.projects.iter_mut().find(|(name, _)| name == display) {
            slot.1 = files;
        } else {
            state.projects.push((display.to_owned(), files));
        }
    }

    pub fn remove_project(&self, display: &str) {
        let mut state = self.fixture.state.lock().unwrap();
        state.projects.retain(|(name, _)| name != display);
    }

    /// Switches the listing format between HTML and PEP 691 JSON.
    pub fn set_format(&self, format: FixtureFormat) {
        self.fixture.state.lock().unwrap().format = format;
    }

    /// Makes every index route answer with `status` until cleared with
    /// `None`. File routes keep working.
    pub fn set_failing(&self, status: Option<u16>) {
        self.fixture.state.lock().unwrap().failing = status
            .map(|code| StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR));
    }

    /// Makes every file download take `delay` (listing hrefs detour
    /// through the delay route).
    pub fn set_file_delay(&self, delay: Option<Duration>) {
        self.fixture.state.lock().unwrap().file_delay = delay;
    }

    /// Returns the sum total of hits and clears the hit counts.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Returns a sorted list of `(path, hits)`-tuples, and clears the hit
    /// counts.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_iter().collect()
    }

    /// Hits recorded for one path so far (does not clear).
    pub fn hits(&self, path: &str) -> usize {
        self.hits
            .lock()
            .unwrap()
            .get(path)
            .copied()
            .unwrap_or_default()
    }

    /// Returns a full URL pointing at the given path.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://127.0.0.1:{}/{}", self.socket.port(), path)
            .parse()
            .unwrap()
    }

    /// The simple-repository base URL of this server.
    pub fn index_url(&self) -> Url {
        self.url("/simple/")
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn file_href(delay: Option<Duration>, project: &str, file: &FixtureFile) -> String {
    let mut href = match delay {
        // Relative hrefs on purpose: clients must resolve them against the
        // request URL.
        None => format!("../../files/{}/{}", project, file.filename),
        Some(delay) => format!(
            "../../delay/{}/files/{}/{}",
            humantime::format_duration(delay),
            project,
            file.filename
        ),
    };
    if let Some(sha256) = &file.sha256 {
        href.push_str(&format!("#sha256={sha256}"));
    }
    href
}

fn wants_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains("application/vnd.pypi.simple.v1+json"))
}

const JSON_CONTENT_TYPE: &str = "application/vnd.pypi.simple.v1+json";

async fn root_listing(State(fixture): State<Fixture>, headers: HeaderMap) -> Response {
    let state = fixture.state.lock().unwrap();
    if let Some(status) = state.failing {
        return status.into_response();
    }

    if state.format == FixtureFormat::Json && wants_json(&headers) {
        let projects: Vec<_> = state
            .projects
            .iter()
            .map(|(name, _)| serde_json::json!({"name": name}))
            .collect();
        let body = serde_json::json!({
            "meta": {"api-version": "1.0"},
            "projects": projects,
        });
        return (
            [(header::CONTENT_TYPE, JSON_CONTENT_TYPE)],
            body.to_string(),
        )
            .into_response();
    }

    let mut body = String::from("<!DOCTYPE html>\n<html><body>\n");
    for (name, _) in &state.projects {
        body.push_str(&format!(
            "<a href=\"{0}/\">{1}</a><br/>\n",
            escape(name),
            escape(name)
        ));
    }
    body.push_str("</body></html>\n");
    ([(header::CONTENT_TYPE, "text/html")], body).into_response()
}

async fn project_listing(
    State(fixture): State<Fixture>,
    extract::Path(project): extract::Path<String>,
    headers: HeaderMap,
) -> Response {
    let state = fixture.state.lock().unwrap();
    if let Some(status) = state.failing {
        return status.into_response();
    }

    let entry = state.projects.iter().find(|(name, _)| {
        name == &project || normalize(name) == project
    });
    let Some((display, files)) = entry else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if state.format == FixtureFormat::Json && wants_json(&headers) {
        let files: Vec<_> = files
            .iter()
            .map(|file| {
                let mut value = serde_json::json!({
                    "filename": file.filename,
                    "url": file_href(state.file_delay, display, file),
                    "hashes": match &file.sha256 {
                        Some(digest) => serde_json::json!({"sha256": digest}),
                        None => serde_json::json!({}),
                    },
                });
                if let Some(spec) = &file.requires_python {
                    value["requires-python"] = serde_json::json!(spec);
                }
                value
            })
            .collect();
        let body = serde_json::json!({
            "meta": {"api-version": "1.0"},
            "name": display,
            "files": files,
        });
        return (
            [(header::CONTENT_TYPE, JSON_CONTENT_TYPE)],
            body.to_string(),
        )
            .into_response();
    }

    let mut body = format!(
        "<!DOCTYPE html>\n<html><body><h1>Links for {}</h1>\n",
        escape(display)
    );
    for file in files {
        let mut attributes = String::new();
        if let Some(spec) = &file.requires_python {
            attributes.push_str(&format!(" data-requires-python=\"{}\"", escape(spec)));
        }
        body.push_str(&format!(
            "<a href=\"{0}\"{1}>{2}</a><br/>\n",
            escape(&file_href(state.file_delay, display, file)),
            attributes,
            escape(&file.filename)
        ));
    }
    body.push_str("</body></html>\n");
    ([(header::CONTENT_TYPE, "text/html")], body).into_response()
}

async fn serve_file(
    State(fixture): State<Fixture>,
    extract::Path((project, filename)): extract::Path<(String, String)>,
) -> Response {
    let state = fixture.state.lock().unwrap();
    let file = state
        .projects
        .iter()
        .find(|(name, _)| name == &project)
        .and_then(|(_, files)| files.iter().find(|file| file.filename == filename));
    match file {
        Some(file) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            file.content.clone(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Just enough name normalization for route matching in fixtures.
fn normalize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending = false;
    for c in name.chars() {
        if matches!(c, '-' | '_' | '.') {
            pending = true;
        } else {
            if pending && !out.is_empty() {
                out.push('-');
            }
            pending = false;
            out.push(c.to_ascii_lowercase());
        }
    }
    out
}
