//! Helpers for testing the cache engine.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the cache directory is deleted while
//!    the test still uses it. To avoid this, assign it to a variable in the test function
//!    (e.g. `let cache_dir = test::tempdir()`).
//!
//!  - When using [`BlobServer`], make sure that the server is held until all requests to it
//!    have been made. If the server is dropped, all connections to it will fail.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::{self, State};
use axum::http::StatusCode;
use axum::routing::{any, get};
use axum::{Router, middleware};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;
use url::Url;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `compcache_service` crate and
///    mutes all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("compcache_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
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
    /// Creates a new test server serving the given router.
    pub fn with_router(router: Router) -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = std::net::TcpListener::bind(addr).unwrap();
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

type Blobs = Arc<Mutex<BTreeMap<String, Vec<u8>>>>;

/// An HTTP server storing blobs in memory, for use as secondary storage.
///
/// The server offers these routes:
///
///  - `/cache/<key>`: `GET`, `HEAD` and `PUT` of blobs.
///  - `/fail/<key>`: answers every request with `500 Internal Server Error`.
///  - `/delay/<duration>/<key>`: waits for the `humantime` duration, then answers `404 Not Found`.
#[derive(Debug)]
pub struct BlobServer {
    server: Server,
    blobs: Blobs,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl BlobServer {
    pub fn new() -> Self {
        let blobs = Blobs::default();
        let hits = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = hits.clone();
            move |extract::OriginalUri(uri): extract::OriginalUri,
                  req: extract::Request,
                  next: middleware::Next| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        let hits = hits.entry(uri.path().to_owned()).or_default();
                        *hits += 1;
                    }

                    next.run(req).await
                }
            }
        };

        let router = Router::new()
            .route("/cache/*key", get(get_blob).put(put_blob))
            .route(
                "/fail/*key",
                any(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
            )
            .route(
                "/delay/:time/*key",
                any(
                    |extract::Path((time, _)): extract::Path<(String, String)>| async move {
                        let duration = humantime::parse_duration(&time).unwrap();
                        tokio::time::sleep(duration).await;
                        StatusCode::NOT_FOUND
                    },
                ),
            )
            .layer(middleware::from_fn(hitcounter))
            .with_state(blobs.clone());

        let server = Server::with_router(router);

        Self {
            server,
            blobs,
            hits,
        }
    }

    /// Returns a full URL pointing to the given path.
    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }

    /// Returns the stored blob with the given key.
    pub fn blob(&self, key: &str) -> Option<Vec<u8>> {
        self.blobs.lock().unwrap().get(key).cloned()
    }

    /// Stores a blob as if it had been uploaded.
    pub fn insert(&self, key: &str, data: impl Into<Vec<u8>>) {
        self.blobs.lock().unwrap().insert(key.to_owned(), data.into());
    }

    /// Returns the keys of all stored blobs.
    pub fn keys(&self) -> Vec<String> {
        self.blobs.lock().unwrap().keys().cloned().collect()
    }

    /// Returns and resets the total number of requests.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Returns and resets the number of requests per path.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_iter().collect()
    }
}

impl Default for BlobServer {
    fn default() -> Self {
        Self::new()
    }
}

async fn get_blob(
    State(blobs): State<Blobs>,
    extract::Path(key): extract::Path<String>,
) -> Result<Vec<u8>, StatusCode> {
    blobs
        .lock()
        .unwrap()
        .get(&key)
        .cloned()
        .ok_or(StatusCode::NOT_FOUND)
}

async fn put_blob(
    State(blobs): State<Blobs>,
    extract::Path(key): extract::Path<String>,
    body: Bytes,
) -> StatusCode {
    blobs.lock().unwrap().insert(key, body.to_vec());
    StatusCode::CREATED
}
