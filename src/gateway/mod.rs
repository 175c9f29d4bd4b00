//! HTTP request gateway: terminates client connections, translates query
//! requests into pooled backend executions, and maps errors to statuses.

pub mod tls;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::service::TowerToHyperService;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::pool::Pool;
use crate::supervisor::{Lifecycle, admits_requests};
use crate::value::QueryRequest;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub lifecycle: watch::Receiver<Lifecycle>,
    /// Default and maximum per-request deadline.
    pub request_timeout: Duration,
    /// Accepted Bearer tokens; empty set disables client auth.
    pub auth_tokens: Arc<HashSet<String>>,
}

/// Query execution request body.
#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<Value>,
    pub timeout_ms: Option<u64>,
}

/// One column descriptor in a response.
#[derive(Debug, Serialize)]
pub struct ColumnBody {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

/// Successful query response.
#[derive(Debug, Serialize)]
pub struct ExecResponse {
    pub columns: Vec<ColumnBody>,
    pub rows: Vec<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
}

/// Error response body: `{"error": {"kind", "sqlstate"?, "message"}}`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sqlstate: Option<String>,
    pub message: String,
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/exec", post(exec))
        .route("/health", get(|| async { "ok" }))
        .route("/ready", get(ready))
        .with_state(state)
}

async fn ready(State(state): State<AppState>) -> Response {
    if admits_requests(*state.lifecycle.borrow()) {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

async fn exec(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ExecRequest>,
) -> Response {
    if let Err(status) = authorize(&state, &headers) {
        return status;
    }

    match run_query(&state, body).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => error_response(err),
    }
}

/// Bearer-token guard. Tokens come from the `AUTH_TOKENS` environment;
/// with none configured the endpoint is open.
fn authorize(state: &AppState, headers: &HeaderMap) -> core::result::Result<(), Response> {
    if state.auth_tokens.is_empty() {
        return Ok(());
    }

    let header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match header.and_then(|h| h.strip_prefix("Bearer ")) {
        Some(token) if state.auth_tokens.contains(token) => Ok(()),
        Some(_) => {
            debug!("invalid bearer token");
            Err(unauthorized("invalid token"))
        }
        None => Err(unauthorized("missing or malformed Authorization header")),
    }
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorBody {
            error: ErrorDetail {
                kind: "unauthorized",
                sqlstate: None,
                message: message.to_string(),
            },
        }),
    )
        .into_response()
}

async fn run_query(state: &AppState, body: ExecRequest) -> Result<ExecResponse> {
    // Fail fast outside Ready: draining and warming never touch the pool.
    if !admits_requests(*state.lifecycle.borrow()) {
        return Err(Error::Unavailable("service is not ready"));
    }

    let request = QueryRequest::new(
        body.sql,
        &body.params,
        body.timeout_ms.map(Duration::from_millis),
    )?;

    // One deadline bounds pool acquisition and execution combined. The
    // client may only tighten it, never extend past the configured cap.
    let timeout = request
        .timeout
        .unwrap_or(state.request_timeout)
        .min(state.request_timeout);
    let deadline = Instant::now() + timeout;

    let mut lease = state.pool.acquire(deadline).await?;
    debug!(backend_pid = lease.backend_pid(), "lease acquired");

    let result = lease.execute(&request, deadline).await?;

    Ok(ExecResponse {
        columns: result
            .columns
            .iter()
            .map(|c| ColumnBody {
                name: c.name.clone(),
                type_name: c.type_name(),
            })
            .collect(),
        rows: result.rows_to_json(),
        rows_affected: result.rows_affected,
    })
}

/// Map the error taxonomy onto HTTP statuses. Backend detail (SQLSTATE,
/// message) passes through verbatim; connect-level detail never reaches
/// clients beyond a generic 503.
fn error_response(err: Error) -> Response {
    let (status, kind, sqlstate, message) = match &err {
        Error::Backend(fields) => {
            let sqlstate = fields.code.clone();
            // Integrity violations are the client's data problem.
            let status = match sqlstate.as_deref() {
                Some(code) if code.starts_with("23") => StatusCode::UNPROCESSABLE_ENTITY,
                _ => StatusCode::BAD_REQUEST,
            };
            let message = fields
                .message
                .clone()
                .unwrap_or_else(|| "backend error".to_string());
            (status, "backend_error", sqlstate, message)
        }
        Error::QueryTimeout => (
            StatusCode::GATEWAY_TIMEOUT,
            "timeout",
            None,
            err.to_string(),
        ),
        Error::PoolTimeout => (
            StatusCode::SERVICE_UNAVAILABLE,
            "pool_timeout",
            None,
            err.to_string(),
        ),
        Error::Unavailable(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "unavailable",
            None,
            err.to_string(),
        ),
        Error::InvalidRequest(_) => (
            StatusCode::BAD_REQUEST,
            "invalid_request",
            None,
            err.to_string(),
        ),
        Error::Protocol(_) => (
            StatusCode::BAD_GATEWAY,
            "protocol_error",
            None,
            err.to_string(),
        ),
        Error::Io(_) | Error::ConnectionBroken | Error::Tls(_) => (
            StatusCode::BAD_GATEWAY,
            "network_error",
            None,
            err.to_string(),
        ),
        // Backend auth/config failures are operator problems, not client ones.
        Error::Auth(_) | Error::Config(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "unavailable",
            None,
            "backend unavailable".to_string(),
        ),
    };

    if status.is_server_error() {
        warn!(%err, "request failed");
    } else {
        debug!(%err, "request rejected");
    }

    (
        status,
        Json(ErrorBody {
            error: ErrorDetail {
                kind,
                sqlstate,
                message,
            },
        }),
    )
        .into_response()
}

/// Resolves when the lifecycle leaves the request-serving states, which
/// is the listener's cue to stop accepting.
async fn drain_signal(mut lifecycle: watch::Receiver<Lifecycle>) {
    loop {
        let state = *lifecycle.borrow();
        if matches!(state, Lifecycle::Draining | Lifecycle::Stopped) {
            return;
        }
        if lifecycle.changed().await.is_err() {
            return;
        }
    }
}

/// Serve plaintext HTTP until the drain signal.
pub async fn serve_plain(
    listener: TcpListener,
    app: Router,
    lifecycle: watch::Receiver<Lifecycle>,
) -> Result<()> {
    info!("listening for plaintext HTTP");
    axum::serve(listener, app)
        .with_graceful_shutdown(drain_signal(lifecycle))
        .await?;
    Ok(())
}

/// Serve HTTPS until the drain signal: accept, TLS-handshake, then hand
/// each connection to hyper on its own task.
pub async fn serve_tls(
    listener: TcpListener,
    app: Router,
    acceptor: TlsAcceptor,
    lifecycle: watch::Receiver<Lifecycle>,
) -> Result<()> {
    info!("listening for TLS HTTP");
    loop {
        let accepted = tokio::select! {
            () = drain_signal(lifecycle.clone()) => return Ok(()),
            accepted = listener.accept() => accepted,
        };

        let (tcp, peer_addr) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let app = app.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(tcp).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(%peer_addr, error = %e, "TLS accept error");
                    return;
                }
            };

            let service = TowerToHyperService::new(app);
            if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(tls_stream), service)
                .await
            {
                debug!(%peer_addr, error = %e, "connection error");
            }
        });
    }
}
