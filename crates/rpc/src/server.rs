use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use pinledger_pinning::{PinError, PinService};
use pinledger_registry::{Address, CidHash, FileRegistry, RegistryError, RegistryStats};
use serde::Serialize;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::files::{
    handle_file_exists, handle_get_file, handle_get_file_by_hash, handle_pin, handle_store_file,
    handle_unpin, handle_uploader_files,
};

/// Header carrying the account on whose behalf a request is made.
pub const CALLER_HEADER: &str = "x-caller-address";

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<FileRegistry>,
    pub pin_service: Arc<dyn PinService>,
    pub node_id: String,
    pub start_time: Instant,
    pub req_count: Arc<AtomicUsize>,
    /// Browser origins allowed by CORS; `*` allows any.
    pub allowed_origins: Vec<String>,
}

impl AppState {
    pub fn new(
        registry: Arc<FileRegistry>,
        pin_service: Arc<dyn PinService>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            pin_service,
            node_id: node_id.into(),
            start_time: Instant::now(),
            req_count: Arc::new(AtomicUsize::new(0)),
            allowed_origins: Vec::new(),
        }
    }

    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = origins;
        self
    }

    pub(crate) fn record_request(&self) -> u64 {
        self.req_count.fetch_add(1, Ordering::Relaxed) as u64 + 1
    }

    fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

pub(crate) type SharedState = Arc<AppState>;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    node_id: String,
    uptime_secs: u64,
    file_count: u64,
    pin_backend: &'static str,
    req_total: u64,
}

#[derive(Debug, Serialize)]
struct VersionResponse {
    node_id: String,
    version: &'static str,
    git_commit: &'static str,
}

#[derive(Debug, Serialize)]
struct RegistryResponse {
    #[serde(flatten)]
    stats: RegistryStats,
    req_total: u64,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn new<S: Into<String>>(status: StatusCode, code: &'static str, message: S) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub(crate) fn bad_request<S: Into<String>>(code: &'static str, message: S) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub(crate) fn unauthenticated<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "missing_caller", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let payload = Json(ErrorResponse {
            error: self.code,
            message: self.message,
        });
        (self.status, payload).into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        let status = match &err {
            RegistryError::DuplicateRecord { .. } => StatusCode::CONFLICT,
            RegistryError::NotFound { .. } => StatusCode::NOT_FOUND,
            RegistryError::Unauthorized { .. } => StatusCode::FORBIDDEN,
            RegistryError::EmptyCid => StatusCode::BAD_REQUEST,
            RegistryError::Storage(_) => {
                warn!("Registry storage failure: {err}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.code(), err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        debug!(status = %rejection.status(), "Rejected request body");
        Self::bad_request("invalid_body", rejection.body_text())
    }
}

/// JSON body extractor whose rejections use the API error format.
#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub(crate) struct ApiJson<T>(pub T);

impl From<PinError> for ApiError {
    fn from(err: PinError) -> Self {
        match err {
            PinError::EmptyCid => Self::bad_request("empty_cid", err.to_string()),
            PinError::EmptyContent => Self::bad_request("empty_content", err.to_string()),
            other => {
                warn!("Pinning service failure: {other}");
                Self::new(StatusCode::BAD_GATEWAY, "pin_service_error", other.to_string())
            }
        }
    }
}

/// Caller account from the request headers, if one was supplied.
pub(crate) fn optional_caller(headers: &HeaderMap) -> Result<Option<Address>, ApiError> {
    let Some(value) = headers.get(CALLER_HEADER) else {
        return Ok(None);
    };
    let text = value
        .to_str()
        .map_err(|_| ApiError::bad_request("invalid_caller", "caller header is not ASCII"))?;
    Address::from_hex(text)
        .map(Some)
        .map_err(|e| ApiError::bad_request("invalid_caller", format!("invalid caller address: {e}")))
}

pub(crate) fn required_caller(headers: &HeaderMap) -> Result<Address, ApiError> {
    optional_caller(headers)?.ok_or_else(|| {
        ApiError::unauthenticated(format!("the {CALLER_HEADER} header is required"))
    })
}

pub(crate) fn parse_cid_hash(value: &str) -> Result<CidHash, ApiError> {
    CidHash::from_hex(value).map_err(|e| {
        ApiError::bad_request("invalid_cid_hash", format!("invalid CID hash: {e}"))
    })
}

pub(crate) fn parse_address(value: &str) -> Result<Address, ApiError> {
    Address::from_hex(value)
        .map_err(|e| ApiError::bad_request("invalid_address", format!("invalid address: {e}")))
}

pub async fn start_server(state: AppState, addr: &str) -> Result<()> {
    let app = build_router(state);
    let listener = bind_listener(addr).await?;
    info!("RPC listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("RPC server terminated unexpectedly")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

async fn bind_listener(addr: &str) -> Result<tokio::net::TcpListener> {
    if let Ok(socket_addr) = addr.parse::<SocketAddr>() {
        tokio::net::TcpListener::bind(socket_addr)
            .await
            .with_context(|| format!("failed to bind RPC listener on {socket_addr}"))
    } else {
        tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind RPC listener on {addr}"))
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.allowed_origins);
    let state: SharedState = Arc::new(state);

    Router::new()
        .route("/health", get(handle_health))
        .route("/version", get(handle_version))
        .route("/metrics", get(handle_metrics))
        .route("/registry", get(handle_registry))
        .route("/files", post(handle_store_file))
        .route("/files/:cid", get(handle_get_file))
        .route("/files/:cid/exists", get(handle_file_exists))
        .route("/hashes/:cid_hash", get(handle_get_file_by_hash))
        .route("/hashes/:cid_hash/pin", post(handle_pin).delete(handle_unpin))
        .route("/uploaders/:address/files", get(handle_uploader_files))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|origin| origin == "*") {
        return CorsLayer::permissive();
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {:?}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, HeaderName::from_static(CALLER_HEADER)])
}

async fn handle_health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let req_total = state.record_request();
    Json(HealthResponse {
        status: "ok",
        node_id: state.node_id.clone(),
        uptime_secs: state.uptime_seconds(),
        file_count: state.registry.file_count(),
        pin_backend: state.pin_service.name(),
        req_total,
    })
}

async fn handle_version(State(state): State<SharedState>) -> Json<VersionResponse> {
    state.record_request();
    Json(VersionResponse {
        node_id: state.node_id.clone(),
        version: env!("CARGO_PKG_VERSION"),
        git_commit: option_env!("GIT_COMMIT_HASH").unwrap_or("unknown"),
    })
}

async fn handle_registry(State(state): State<SharedState>) -> Json<RegistryResponse> {
    let req_total = state.record_request();
    Json(RegistryResponse {
        stats: state.registry.stats(),
        req_total,
    })
}

async fn handle_metrics(State(state): State<SharedState>) -> Response {
    let req_total = state.record_request();
    let uptime = state.uptime_seconds();
    let stats = state.registry.stats();

    let mut metrics =
        "# HELP pinledger_http_requests_total Total number of RPC requests handled\n".to_string();
    metrics.push_str("# TYPE pinledger_http_requests_total counter\n");
    metrics.push_str(&format!("pinledger_http_requests_total {req_total}\n"));
    metrics.push_str("# HELP pinledger_uptime_seconds Uptime of the node in seconds\n");
    metrics.push_str("# TYPE pinledger_uptime_seconds gauge\n");
    metrics.push_str(&format!("pinledger_uptime_seconds {uptime}\n"));
    metrics.push_str("# HELP pinledger_files_total Files recorded in the registry\n");
    metrics.push_str("# TYPE pinledger_files_total gauge\n");
    metrics.push_str(&format!("pinledger_files_total {}\n", stats.file_count));
    metrics.push_str("# HELP pinledger_pinned_files Files currently flagged as pinned\n");
    metrics.push_str("# TYPE pinledger_pinned_files gauge\n");
    metrics.push_str(&format!("pinledger_pinned_files {}\n", stats.pinned_count));
    metrics.push_str("# HELP pinledger_uploaders Distinct uploader accounts\n");
    metrics.push_str("# TYPE pinledger_uploaders gauge\n");
    metrics.push_str(&format!("pinledger_uploaders {}\n", stats.uploader_count));

    let mut response = Response::new(Body::from(metrics));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    response
}
