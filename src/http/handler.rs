//! Main axum router and HTTP request handlers for the gateway.
//!
//! Routes:
//! - `GET  /healthz`  - Health check
//! - `GET  /metrics`  - Prometheus metrics
//! - anything else whose path or query names `git-upload*` / `git-receive*`
//!   is gated and handed to `git http-backend`; other paths are 404.
//!
//! `OPTIONS` is answered on every path without gating, and every response
//! carries `Access-Control-Allow-Origin: *`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tracing::{error, info, instrument, warn};

use crate::auth::gate::{Decision, DenyReason, GateError, Operation};
use crate::auth::middleware::{extract_credential, extract_repository, is_git_request};
use crate::git::GitRequest;
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(crate::health::health_handler))
        .route("/metrics", get(handle_metrics))
        .fallback(handle_git)
        .layer(middleware::from_fn(cors))
        .with_state(state)
}

/// Answer preflights directly and stamp the allow-origin header on
/// everything else.
async fn cors(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return (
            StatusCode::OK,
            [
                (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
                (header::ACCESS_CONTROL_ALLOW_HEADERS, "*"),
            ],
        )
            .into_response();
    }

    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Gate a Git smart-HTTP request and, if allowed, run it through the
/// configured git backend.
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
async fn handle_git(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Response, AppError> {
    let uri = request.uri().clone();
    if !is_git_request(&uri) {
        return Ok(not_found());
    }
    let Some(repository) = extract_repository(&uri) else {
        return Ok(not_found());
    };

    let credential = extract_credential(request.headers());
    let operation = Operation::from_uri(&uri);

    let effective_identity = match state.gate.authorize(&repository, &credential, operation).await? {
        Decision::Allow { effective_identity } => effective_identity,
        Decision::Deny(reason) => return Err(AppError::Forbidden(reason)),
    };

    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let (parts, body) = request.into_parts();
    let git_request = GitRequest {
        method: parts.method,
        uri: parts.uri,
        headers: parts.headers,
        body,
        remote_addr,
    };

    info!(%repository, ?operation, "forwarding to git backend");
    state
        .git
        .serve(git_request, effective_identity.as_deref())
        .await
        .map_err(|e| {
            state.metrics.metrics.git_backend_failures.inc();
            AppError::Internal(e)
        })
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the gateway.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "not found").into_response()
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
///
/// Bodies are short plain text; details are logged, never returned.
#[derive(Debug)]
pub enum AppError {
    /// The gate refused the request.
    Forbidden(DenyReason),
    /// The permission authority could not be reached.
    Unavailable,
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Forbidden(reason) => {
                (StatusCode::FORBIDDEN, reason.message()).into_response()
            }
            AppError::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "permission service unavailable",
            )
                .into_response(),
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
            }
        }
    }
}

impl From<GateError> for AppError {
    fn from(err: GateError) -> Self {
        match err {
            GateError::AuthorityUnavailable(e) => {
                warn!(error = %e, "rejecting request: authority unavailable");
                AppError::Unavailable
            }
            GateError::QuotaMeasurement(e) => AppError::Internal(e),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}
