//! IPC server: axum routers served over Unix domain sockets.
//!
//! Every accepted connection passes the [`ClientPolicy`] before any byte of
//! HTTP is read. Rejected peers are logged and dropped; the accept loop keeps
//! going. Accepted connections are served by hyper with the peer's
//! [`PeerIdentity`] attached to each request as an extension.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use axum::extract::{Extension, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use powergate_config::AppConfig;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

use super::peer::{ClientPolicy, PeerIdentity};
use super::types::*;
use crate::auth::{Right, TokenBroker};
use crate::build_info::BuildInfo;
use crate::daemon::ShutdownSignal;
use crate::dispatch::{Dispatcher, ReplyStatus};
use crate::identity::DaemonIdentity;

/// Shared state of the privileged command endpoint.
pub struct DaemonState {
    pub dispatcher: Arc<Dispatcher>,
    pub identity: DaemonIdentity,
}

/// Shared state of the authorization service endpoint.
pub struct AuthorityState {
    pub broker: Arc<TokenBroker>,
    pub config: AppConfig,
}

/// Routes of the privileged daemon socket.
pub fn daemon_router(state: Arc<DaemonState>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/unique-id", get(handle_unique_id))
        .route("/execute", post(handle_execute))
        .route("/state", get(handle_state))
        .route("/settings", get(handle_settings).post(handle_set_settings))
        .with_state(state)
}

/// Routes of the authorization service socket.
pub fn authority_router(state: Arc<AuthorityState>) -> Router {
    Router::new()
        .route("/authorize", post(handle_authorize))
        .with_state(state)
}

/// Serve `app` on a Unix socket until a shutdown signal arrives.
///
/// Removes any stale socket file before binding and after stopping. Open
/// connections are shut down gracefully and awaited before returning.
pub async fn serve(
    socket_path: &Path,
    app: Router,
    policy: ClientPolicy,
    mut shutdown_rx: broadcast::Receiver<ShutdownSignal>,
) -> Result<(), std::io::Error> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(socket_path)?;
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o666))?;
    info!(path = %socket_path.display(), "IPC server listening");

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let Some(peer) = admit(&stream, &policy) else {
                        continue;
                    };
                    connections.spawn(serve_connection(
                        stream,
                        peer,
                        app.clone(),
                        shutdown_rx.resubscribe(),
                    ));
                }
                Err(e) => error!(error = %e, "accept error"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown_rx.recv() => {
                info!(path = %socket_path.display(), "IPC server shutting down");
                break;
            }
        }
    }

    drop(listener);
    std::fs::remove_file(socket_path).ok();
    while connections.join_next().await.is_some() {}
    Ok(())
}

fn admit(stream: &UnixStream, policy: &ClientPolicy) -> Option<PeerIdentity> {
    let peer = match PeerIdentity::of(stream) {
        Ok(peer) => peer,
        Err(e) => {
            warn!(error = %e, "could not read peer credentials, dropping connection");
            return None;
        }
    };
    match policy.check(&peer) {
        Ok(()) => {
            debug!(uid = peer.uid, pid = ?peer.pid, "connection accepted");
            Some(peer)
        }
        Err(reason) => {
            warn!(uid = peer.uid, pid = ?peer.pid, %reason, "connection by invalid client");
            None
        }
    }
}

async fn serve_connection(
    stream: UnixStream,
    peer: PeerIdentity,
    app: Router,
    mut shutdown_rx: broadcast::Receiver<ShutdownSignal>,
) {
    let service = hyper::service::service_fn(move |mut req: hyper::Request<Incoming>| {
        req.extensions_mut().insert(peer.clone());
        app.clone().oneshot(req)
    });

    let conn = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown_rx.recv() => {
            conn.as_mut().graceful_shutdown();
            conn.as_mut().await
        }
    };
    if let Err(e) = result {
        debug!(error = %e, "IPC connection closed with error");
    }
}

// ── Daemon route handlers ───────────────────────────────────────────────

async fn handle_health(State(state): State<Arc<DaemonState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        build: BuildInfo::current(),
        supported: state.dispatcher.supported(),
    })
}

async fn handle_unique_id(State(state): State<Arc<DaemonState>>) -> Json<UniqueIdResponse> {
    Json(UniqueIdResponse {
        unique_id: state.identity.to_hex(),
    })
}

async fn handle_execute(
    State(state): State<Arc<DaemonState>>,
    Json(req): Json<ExecuteRequest>,
) -> Json<CommandReply> {
    let dispatcher = Arc::clone(&state.dispatcher);
    let token = decode_token(req.token.as_deref());
    let status = tokio::task::spawn_blocking(move || dispatcher.dispatch(token.as_deref(), req.command))
        .await
        .unwrap_or_else(|e| {
            error!(error = %e, "command handler panicked");
            ReplyStatus::Failure
        });
    Json(CommandReply { status })
}

async fn handle_state(State(state): State<Arc<DaemonState>>) -> Json<StateResponse> {
    let dispatcher = Arc::clone(&state.dispatcher);
    let snapshot = tokio::task::spawn_blocking(move || dispatcher.state())
        .await
        .unwrap_or_default();
    Json(StateResponse { state: snapshot })
}

async fn handle_settings(State(state): State<Arc<DaemonState>>) -> Json<SettingsResponse> {
    Json(SettingsResponse {
        settings: state.dispatcher.settings(),
    })
}

async fn handle_set_settings(
    State(state): State<Arc<DaemonState>>,
    Json(req): Json<SetSettingsRequest>,
) -> Json<CommandReply> {
    let dispatcher = Arc::clone(&state.dispatcher);
    let token = decode_token(req.token.as_deref());
    let status =
        tokio::task::spawn_blocking(move || dispatcher.set_settings(token.as_deref(), req.settings))
            .await
            .unwrap_or(ReplyStatus::Failure);
    Json(CommandReply { status })
}

// ── Authorization route handlers ────────────────────────────────────────

async fn handle_authorize(
    State(state): State<Arc<AuthorityState>>,
    Extension(peer): Extension<PeerIdentity>,
    Json(req): Json<AuthorizeRequest>,
) -> Result<Json<AuthorizeResponse>, (StatusCode, Json<ErrorResponse>)> {
    let mut rights = Vec::with_capacity(req.rights.len());
    for name in &req.rights {
        let right = Right::from_name(name).ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: format!("unknown right {name:?}"),
                }),
            )
        })?;
        rights.push(right);
    }

    let role = state.config.role_for(&peer.username(), peer.uid);
    let token = state.broker.mint(&role, &rights).map_err(|e| {
        (
            StatusCode::FORBIDDEN,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
    })?;

    Ok(Json(AuthorizeResponse {
        token: hex::encode(token.as_bytes()),
    }))
}
