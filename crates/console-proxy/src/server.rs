//! HTTP front end: token handshake, console page, WebSocket attach and key
//! rotation.
//!
//! Routes:
//! - `GET /console?token=<t>`: open the token, register a session and redirect
//!   the browser to the console page for it.
//! - `GET /console?path=<id>`: serve the console page for an existing session.
//! - `GET /vnc/<id>`: dial the upstream tunnel, then upgrade to a WebSocket and
//!   relay.
//! - `POST /setEncryptorPassword`: replace the token secret (loopback only).
//! - `GET /static/*`: files from the static directory.

use crate::config::ServerConfig;
use crate::relay::ProxyPump;
use crate::session::SessionRegistry;
use crate::transport::WS_PROTOCOL;
use crate::tunnel::TunnelConnector;
use axum::body::Bytes;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use console_core::{open_token, ConsoleError, ConsoleResult, EncryptorSecret, SecretCell};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// How often unclaimed sessions are swept.
pub const GC_INTERVAL: Duration = Duration::from_secs(60);

/// Page served for a session; the browser client reads `path` from its URL.
const CONSOLE_PAGE: &str = "vnc.html";

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub secret: SecretCell,
    pub registry: Arc<SessionRegistry>,
    pub connector: Arc<TunnelConnector>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> ConsoleResult<Self> {
        let connector = TunnelConnector::new(&config.upstream)?;
        Ok(Self {
            secret: SecretCell::new(config.secret.clone()),
            registry: Arc::new(SessionRegistry::new(config.max_sessions)),
            connector: Arc::new(connector),
            config: Arc::new(config),
        })
    }
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    let static_files = ServeDir::new(&state.config.static_dir);
    Router::new()
        .route("/console", get(console))
        .route("/vnc/:session_id", get(vnc_websocket))
        .route("/setEncryptorPassword", post(set_encryptor_password))
        .nest_service("/static", static_files)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind the configured address and serve until `shutdown` resolves.
pub async fn run<F>(config: ServerConfig, shutdown: F) -> ConsoleResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let state = AppState::new(config)?;
    let listener = TcpListener::bind(state.config.addr()).await?;
    info!(
        addr = %listener.local_addr()?,
        static_dir = %state.config.static_dir.display(),
        "console proxy listening"
    );

    let gc = spawn_gc(state.registry.clone(), state.config.session_ttl);
    let result = serve(listener, state, shutdown).await;
    gc.abort();
    result
}

/// Serve on an already bound listener.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> ConsoleResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Periodically drop sessions that were never attached.
fn spawn_gc(registry: Arc<SessionRegistry>, ttl: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(GC_INTERVAL);
        // First tick fires immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            registry.gc(ttl).await;
        }
    })
}

#[derive(Debug, Deserialize)]
struct ConsoleQuery {
    token: Option<String>,
    path: Option<String>,
}

async fn console(
    State(state): State<AppState>,
    Query(query): Query<ConsoleQuery>,
) -> Result<Response, ApiError> {
    if let Some(token) = query.token {
        let secret = state.secret.get().await;
        let descriptor = open_token(&secret, &token)
            .and_then(|d| d.validate().map(|()| d))
            .inspect_err(|e| warn!(error = %e, "rejected console token"))?;

        let id = state.registry.create(descriptor).await?;
        let location = format!("/static/{CONSOLE_PAGE}?path={id}");
        return Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response());
    }

    if let Some(id) = query.path {
        state.registry.lookup(&id).await?;
        let page = tokio::fs::read_to_string(state.config.static_dir.join(CONSOLE_PAGE))
            .await
            .map_err(ConsoleError::from)?;
        return Ok(Html(page).into_response());
    }

    Err(ConsoleError::Validation("expected a token or path parameter".into()).into())
}

async fn vnc_websocket(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let (descriptor, link) = state.registry.begin_connect(&session_id).await?;

    // Dial before answering the upgrade so a dead upstream surfaces as 502.
    let tunnel = match state.connector.connect(&descriptor).await {
        Ok(tunnel) => tunnel,
        Err(e) => {
            state.registry.release(&session_id, &link).await;
            return Err(e.into());
        }
    };

    let pump = ProxyPump::new(
        state.registry.clone(),
        session_id.clone(),
        link.clone(),
        state.config.idle_timeout,
    );
    let registry = state.registry.clone();

    Ok(ws
        .protocols([WS_PROTOCOL])
        .on_failed_upgrade(move |e| {
            warn!(session_id = %session_id, error = %e, "websocket upgrade failed");
            tokio::spawn(async move {
                registry.release(&session_id, &link).await;
            });
        })
        .on_upgrade(move |socket| pump.run(socket, tunnel)))
}

async fn set_encryptor_password(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    if !is_local_client(&peer) {
        warn!(peer = %peer, "rejected key rotation from remote client");
        return Err(ApiError::forbidden("key rotation is only accepted from localhost"));
    }

    let secret: EncryptorSecret = serde_json::from_slice(&body)
        .map_err(|e| ConsoleError::Validation(format!("key rotation body: {e}")))?;
    secret.check()?;
    state.secret.set(secret).await;

    info!(peer = %peer, "encryption secret replaced");
    Ok(StatusCode::OK)
}

/// Loopback peers, including IPv4-mapped IPv6 loopback.
fn is_local_client(peer: &SocketAddr) -> bool {
    peer.ip().to_canonical().is_loopback()
}

/// Error response: status plus a JSON body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

impl ApiError {
    fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            code: "FORBIDDEN",
            message: message.into(),
        }
    }
}

/// The browser gets a fixed message per class; details stay in the log.
impl From<ConsoleError> for ApiError {
    fn from(e: ConsoleError) -> Self {
        let (status, code, message) = match &e {
            ConsoleError::Decode(_)
            | ConsoleError::Cipher(_)
            | ConsoleError::TruncatedCiphertext(_)
            | ConsoleError::Validation(_) => {
                (StatusCode::BAD_REQUEST, "INVALID_REQUEST", "invalid token or request")
            }
            ConsoleError::Lookup(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", "session not found"),
            ConsoleError::Connect { .. } => (
                StatusCode::BAD_GATEWAY,
                "UPSTREAM_UNAVAILABLE",
                "console host unavailable",
            ),
            ConsoleError::Capacity(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "CAPACITY",
                "too many console sessions",
            ),
            ConsoleError::ProxyIo(_) | ConsoleError::Config(_) | ConsoleError::Io(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", "internal error")
            }
        };

        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %e, "request failed");
        } else {
            debug!(status = status.as_u16(), error = %e, "request rejected");
        }

        Self {
            status,
            code,
            message: message.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.message,
            code: self.code,
        };
        (self.status, Json(body)).into_response()
    }
}
