//! HTTP API
//!
//! ## Client API (caller identified by the `x-caller-id` header)
//! - `POST /request/enqueue` - JSON array of hashes, returns `{"request_id"}`
//! - `GET /request/check/{id}` - 200 active, 202 queued, 400 unusable
//! - `POST /request/cancel/{id}` - abandon a request
//! - `GET /cache/{id}` - framed batch download for an active request
//!
//! ## Internal API (`Authorization: Bearer <internal_token>`)
//! - `GET /dist/{hash}` - single file
//! - `PUT /dist/{hash}` - upload into the authoritative tier
//! - `POST /dist/touch` - JSON array of hashes that were served elsewhere
//!
//! ## Operational
//! - `GET /health`
//! - `GET /metrics`
//!
//! ## Example Usage
//!
//! ```bash
//! # Register a batch
//! curl -X POST -H "x-caller-id: alice" \
//!      -d '["0123456789ABCDEF0123456789ABCDEF01234567"]' \
//!      http://localhost:6200/request/enqueue
//!
//! # Poll until 200, then download
//! curl -H "x-caller-id: alice" http://localhost:6200/request/check/<id>
//! curl -H "x-caller-id: alice" http://localhost:6200/cache/<id> > batch.bin
//! ```

use crate::catalog::{Catalog, CatalogEntry};
use crate::error::FileError;
use crate::framing::{batch_stream, CountingStream, InFlight};
use crate::hash::{self, ContentHash};
use crate::metrics::{Metrics, COUNTER_DOWNLOAD_REQUESTS};
use crate::provider::CachedFileProvider;
use crate::queue::{CheckStatus, FinishGuard, RequestId, RequestQueue};
use crate::touch::TouchPropagator;
use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};

/// Header carrying the authenticated caller identity
pub const CALLER_HEADER: &str = "x-caller-id";

/// Cap on JSON request bodies (hash lists)
const MAX_JSON_BODY: usize = 4 * 1024 * 1024;

pub type HttpBody = UnsyncBoxBody<Bytes, std::io::Error>;

/// HTTP server state
pub struct HttpServer {
    provider: Arc<CachedFileProvider>,
    queue: Arc<RequestQueue>,
    touch: Arc<TouchPropagator>,
    /// Present only on the authoritative node
    catalog: Option<Arc<dyn Catalog>>,
    metrics: Arc<Metrics>,
    internal_token: Option<String>,
    max_upload_bytes: usize,
}

impl HttpServer {
    pub fn new(
        provider: Arc<CachedFileProvider>,
        queue: Arc<RequestQueue>,
        touch: Arc<TouchPropagator>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            provider,
            queue,
            touch,
            catalog: None,
            metrics,
            internal_token: None,
            max_upload_bytes: 256 * 1024 * 1024,
        }
    }

    /// Record uploads in the catalog (authoritative node)
    pub fn with_catalog(mut self, catalog: Arc<dyn Catalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Enable the internal API with a shared secret
    pub fn with_internal_token(mut self, token: Option<String>) -> Self {
        self.internal_token = token;
        self
    }

    pub fn with_max_upload_bytes(mut self, max: u64) -> Self {
        self.max_upload_bytes = usize::try_from(max).unwrap_or(usize::MAX);
        self
    }

    /// Bind and run the HTTP server
    pub async fn run(self: Arc<Self>, bind_addr: SocketAddr) -> Result<(), FileError> {
        let listener = TcpListener::bind(bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already-bound listener
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), FileError> {
        info!(addr = %listener.local_addr()?, "HTTP server listening");

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { server.handle_request(req).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    warn!(addr = %remote_addr, error = %err, "Connection error");
                }
            });
        }
    }

    /// Route requests to handlers
    async fn handle_request(&self, req: Request<Incoming>) -> Result<Response<HttpBody>, Infallible> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        debug!(method = %method, path = %path, "Incoming request");

        let result = match (method, path.as_str()) {
            (Method::GET, "/health") => self.handle_health().await,
            (Method::GET, "/metrics") => Ok(json(StatusCode::OK, &self.metrics.snapshot())),

            // Client API
            (Method::POST, "/request/enqueue") => self.handle_enqueue(req).await,
            (Method::GET, p) if p.starts_with("/request/check/") => {
                let id = p.strip_prefix("/request/check/").unwrap_or("");
                Ok(self.handle_check(&req, id))
            }
            (Method::POST, p) if p.starts_with("/request/cancel/") => {
                let id = p.strip_prefix("/request/cancel/").unwrap_or("");
                Ok(self.handle_cancel(&req, id))
            }
            (Method::GET, p) if p.starts_with("/cache/") => {
                let id = p.strip_prefix("/cache/").unwrap_or("");
                Ok(self.handle_batch(&req, id))
            }

            // Internal API
            (Method::POST, "/dist/touch") => match self.authorize_internal(&req) {
                Some(denied) => Ok(denied),
                None => self.handle_touch(req).await,
            },
            (Method::GET, p) if p.starts_with("/dist/") => match self.authorize_internal(&req) {
                Some(denied) => Ok(denied),
                None => self.handle_get_file(p.strip_prefix("/dist/").unwrap_or("")).await,
            },
            (Method::PUT, p) if p.starts_with("/dist/") => match self.authorize_internal(&req) {
                Some(denied) => Ok(denied),
                None => {
                    let hash = p.strip_prefix("/dist/").unwrap_or("").to_string();
                    self.handle_put_file(req, &hash).await
                }
            },

            _ => Ok(text(StatusCode::NOT_FOUND, "Not Found")),
        };

        Ok(result.unwrap_or_else(|e| match e {
            FileError::InvalidHash(_) | FileError::Json(_) => text(StatusCode::BAD_REQUEST, e.to_string()),
            e if e.is_not_found() => text(StatusCode::NOT_FOUND, e.to_string()),
            e => {
                error!(error = %e, "Request error");
                text(StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {}", e))
            }
        }))
    }

    // ========================================================================
    // Operational
    // ========================================================================

    /// Health check endpoint
    async fn handle_health(&self) -> Result<Response<HttpBody>, FileError> {
        let store = self.provider.store();
        let hot = store.hot().stats().await?;
        let cold = match store.cold() {
            Some(cold) => Some(cold.stats().await?),
            None => None,
        };

        let body = serde_json::json!({
            "status": "ok",
            "authoritative": self.catalog.is_some(),
            "hot": { "files": hot.files, "bytes": hot.bytes },
            "cold": cold.map(|c| serde_json::json!({ "files": c.files, "bytes": c.bytes })),
            "active_requests": self.queue.active_count(),
        });
        Ok(json(StatusCode::OK, &body))
    }

    // ========================================================================
    // Client API
    // ========================================================================

    /// POST /request/enqueue
    async fn handle_enqueue(&self, req: Request<Incoming>) -> Result<Response<HttpBody>, FileError> {
        let Some(caller) = caller_id(&req) else {
            return Ok(empty(StatusCode::UNAUTHORIZED));
        };
        let body = match read_body(req, MAX_JSON_BODY).await {
            Ok(body) => body,
            Err(rejected) => return Ok(rejected),
        };

        let raw: Vec<String> = serde_json::from_slice(&body)?;
        let store = self.provider.store();
        let hashes = raw
            .iter()
            .map(|h| store.parse_hash(h))
            .collect::<Result<Vec<ContentHash>, FileError>>()?;

        let id = self.queue.enqueue(&caller, hashes);
        Ok(json(StatusCode::OK, &serde_json::json!({ "request_id": id })))
    }

    /// GET /request/check/{id}
    fn handle_check(&self, req: &Request<Incoming>, id: &str) -> Response<HttpBody> {
        let Some(caller) = caller_id(req) else {
            return empty(StatusCode::UNAUTHORIZED);
        };
        let Some(id) = parse_request_id(id) else {
            return empty(StatusCode::BAD_REQUEST);
        };

        match self.queue.check(id, &caller) {
            CheckStatus::Active => json(StatusCode::OK, &serde_json::json!({ "status": "active" })),
            CheckStatus::Queued => json(StatusCode::ACCEPTED, &serde_json::json!({ "status": "queued" })),
            CheckStatus::Unusable => empty(StatusCode::BAD_REQUEST),
        }
    }

    /// POST /request/cancel/{id}
    fn handle_cancel(&self, req: &Request<Incoming>, id: &str) -> Response<HttpBody> {
        let Some(caller) = caller_id(req) else {
            return empty(StatusCode::UNAUTHORIZED);
        };
        match parse_request_id(id) {
            Some(id) if self.queue.cancel(id, &caller) => empty(StatusCode::OK),
            _ => empty(StatusCode::BAD_REQUEST),
        }
    }

    /// GET /cache/{id} - stream every available file of an active request
    fn handle_batch(&self, req: &Request<Incoming>, id: &str) -> Response<HttpBody> {
        let Some(caller) = caller_id(req) else {
            return empty(StatusCode::UNAUTHORIZED);
        };
        let Some(id) = parse_request_id(id) else {
            return empty(StatusCode::BAD_REQUEST);
        };
        let Some(request) = self.queue.begin_streaming(id, &caller) else {
            return empty(StatusCode::BAD_REQUEST);
        };

        self.metrics.inc_counter(COUNTER_DOWNLOAD_REQUESTS);
        info!(request_id = %id, owner = %caller, files = request.file_hashes.len(), "Starting batch download");

        // The slot is released when the body is dropped, whatever the outcome
        let in_flight = InFlight::new(self.metrics.clone(), FinishGuard::new(self.queue.clone(), id));
        let stream = batch_stream(self.provider.clone(), request.file_hashes, self.metrics.clone());
        let body = CountingStream::new(stream, self.metrics.clone(), Some(in_flight));

        let mut response = Response::new(StreamBody::new(body.map_ok(Frame::data)).boxed_unsync());
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        response
    }

    // ========================================================================
    // Internal API
    // ========================================================================

    /// `None` if the request carries the internal token, else the refusal
    fn authorize_internal(&self, req: &Request<Incoming>) -> Option<Response<HttpBody>> {
        let Some(token) = &self.internal_token else {
            return Some(empty(StatusCode::FORBIDDEN));
        };
        let presented = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        match presented {
            Some(presented) if presented == token => None,
            _ => Some(empty(StatusCode::UNAUTHORIZED)),
        }
    }

    /// GET /dist/{hash}
    async fn handle_get_file(&self, raw: &str) -> Result<Response<HttpBody>, FileError> {
        let hash = self.provider.store().parse_hash(raw)?;

        let Some(served) = self.provider.fetch(&hash).await? else {
            return Ok(text(StatusCode::NOT_FOUND, "File not found"));
        };
        debug!(hash = %hash, size = served.size, "Serving file");

        let body = ReaderStream::new(served.file).map_ok(Frame::data);
        let mut response = Response::new(StreamBody::new(body).boxed_unsync());
        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(served.size));
        Ok(response)
    }

    /// PUT /dist/{hash}
    async fn handle_put_file(&self, req: Request<Incoming>, raw: &str) -> Result<Response<HttpBody>, FileError> {
        let hash = self.provider.store().parse_hash(raw)?;
        let data = match read_body(req, self.max_upload_bytes).await {
            Ok(data) => data,
            Err(rejected) => return Ok(rejected),
        };

        let size = self.provider.store().authoritative().write(&hash, &data).await?;
        if let Some(catalog) = &self.catalog {
            catalog
                .insert(CatalogEntry {
                    hash: hash.clone(),
                    size_bytes: size,
                })
                .await?;
        }

        info!(hash = %hash, size, "Stored uploaded file");
        Ok(json(StatusCode::CREATED, &serde_json::json!({ "hash": hash, "size": size })))
    }

    /// POST /dist/touch
    async fn handle_touch(&self, req: Request<Incoming>) -> Result<Response<HttpBody>, FileError> {
        let body = match read_body(req, MAX_JSON_BODY).await {
            Ok(body) => body,
            Err(rejected) => return Ok(rejected),
        };
        let raw: Vec<String> = serde_json::from_slice(&body)?;
        let hashes = hash::parse_all(&raw, self.provider.store().hash_len());
        let accepted = hashes.len();

        if !hashes.is_empty() {
            let touch = self.touch.clone();
            tokio::task::spawn_blocking(move || {
                for hash in &hashes {
                    touch.touch(hash);
                }
            });
        }

        Ok(json(StatusCode::OK, &serde_json::json!({ "accepted": accepted })))
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn caller_id<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(CALLER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse_request_id(raw: &str) -> Option<RequestId> {
    RequestId::parse_str(raw).ok()
}

/// Collect a body up to `limit` bytes, or the response to send instead
async fn read_body(req: Request<Incoming>, limit: usize) -> Result<Bytes, Response<HttpBody>> {
    match Limited::new(req.into_body(), limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            Err(text(StatusCode::PAYLOAD_TOO_LARGE, "Body too large"))
        }
        Err(e) => Err(text(StatusCode::BAD_REQUEST, format!("Failed to read body: {}", e))),
    }
}

fn full(chunk: impl Into<Bytes>) -> HttpBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn empty(status: StatusCode) -> Response<HttpBody> {
    let mut response = Response::new(full(Bytes::new()));
    *response.status_mut() = status;
    response
}

fn text(status: StatusCode, msg: impl Into<String>) -> Response<HttpBody> {
    let mut response = Response::new(full(msg.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<HttpBody> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(full(body));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {}", e)),
    }
}
