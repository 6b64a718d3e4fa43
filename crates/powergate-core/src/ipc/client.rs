//! IPC clients for the daemon and authorization sockets.
//!
//! [`DaemonClient`] keeps one persistent HTTP/1.1 connection to the daemon,
//! established lazily and reused across calls. Any transport failure clears
//! the cached connection and fails the call locally; the next call dials
//! again. [`AuthorizationClient`] opens one short-lived connection per token
//! request.

use std::path::{Path, PathBuf};
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::client::conn::http1::SendRequest;
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::UnixStream;
use tracing::{debug, warn};

use super::types::*;
use crate::BoxFuture;
use crate::auth::{CapabilityToken, Right};
use crate::dispatch::{Command, ReplyStatus};
use crate::identity::DaemonIdentity;
use crate::power::{PowerStateSnapshot, Settings};
use crate::registrar::{DaemonLink, TokenSource};

/// Errors from the IPC clients.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("daemon is not running (socket not found at {0})")]
    NotRunning(PathBuf),

    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("request failed: {0}")]
    Request(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("peer returned error: {0}")]
    Remote(String),
}

type Sender = SendRequest<Full<Bytes>>;

async fn dial(socket_path: &Path) -> Result<Sender, ClientError> {
    if !socket_path.exists() {
        return Err(ClientError::NotRunning(socket_path.to_path_buf()));
    }
    let stream = UnixStream::connect(socket_path)
        .await
        .map_err(|source| ClientError::Connect {
            path: socket_path.to_path_buf(),
            source,
        })?;

    let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| ClientError::Request(format!("HTTP handshake failed: {e}")))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "IPC connection ended");
        }
    });
    Ok(sender)
}

async fn round_trip(
    sender: &mut Sender,
    method: hyper::Method,
    path: &str,
    body: Option<Vec<u8>>,
) -> Result<Bytes, ClientError> {
    let mut builder = hyper::Request::builder()
        .method(method)
        .uri(path)
        .header("host", "localhost");
    if body.is_some() {
        builder = builder.header("content-type", "application/json");
    }
    let req = builder
        .body(Full::new(body.map(Bytes::from).unwrap_or_default()))
        .map_err(|e| ClientError::Request(format!("failed to build request: {e}")))?;

    sender
        .ready()
        .await
        .map_err(|e| ClientError::Request(format!("connection not ready: {e}")))?;
    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| ClientError::Request(e.to_string()))?;

    let status = resp.status();
    let bytes = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| ClientError::Request(format!("failed to read response body: {e}")))?
        .to_bytes();

    if !status.is_success() {
        if let Ok(err) = serde_json::from_slice::<ErrorResponse>(&bytes) {
            return Err(ClientError::Remote(err.error));
        }
        return Err(ClientError::Request(format!("unexpected status: {status}")));
    }
    Ok(bytes)
}

fn parse<T: DeserializeOwned>(what: &str, bytes: &[u8]) -> Result<T, ClientError> {
    serde_json::from_slice(bytes).map_err(|e| ClientError::Parse(format!("{what}: {e}")))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ClientError> {
    serde_json::to_vec(value).map_err(|e| ClientError::Parse(format!("failed to serialize: {e}")))
}

// ── Daemon client ───────────────────────────────────────────────────────

/// Persistent client for the privileged daemon socket.
pub struct DaemonClient {
    socket_path: PathBuf,
    timeout: Duration,
    sender: Option<Sender>,
}

impl DaemonClient {
    pub fn new(socket_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout,
            sender: None,
        }
    }

    /// Whether a connection is currently cached.
    pub fn is_connected(&self) -> bool {
        self.sender.as_ref().is_some_and(|s| !s.is_closed())
    }

    /// Drop the cached connection.
    pub fn invalidate(&mut self) {
        if self.sender.take().is_some() {
            debug!("daemon connection invalidated");
        }
    }

    async fn request(
        &mut self,
        method: hyper::Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Bytes, ClientError> {
        if self.sender.as_ref().is_some_and(|s| s.is_closed()) {
            self.invalidate();
        }

        let timeout = self.timeout;
        let result = tokio::time::timeout(timeout, async {
            if self.sender.is_none() {
                self.sender = Some(dial(&self.socket_path).await?);
                debug!(path = %self.socket_path.display(), "daemon connection established");
            }
            match self.sender.as_mut() {
                Some(sender) => round_trip(sender, method, path, body).await,
                None => Err(ClientError::NotRunning(self.socket_path.clone())),
            }
        })
        .await
        .unwrap_or(Err(ClientError::Timeout(timeout)));

        if let Err(e) = &result {
            warn!(path, error = %e, "daemon request failed");
            if !matches!(e, ClientError::Remote(_)) {
                self.invalidate();
            }
        }
        result
    }

    pub async fn health(&mut self) -> Result<HealthResponse, ClientError> {
        let body = self.request(hyper::Method::GET, "/health", None).await?;
        parse("health", &body)
    }

    pub async fn unique_id(&mut self) -> Result<DaemonIdentity, ClientError> {
        let body = self.request(hyper::Method::GET, "/unique-id", None).await?;
        let resp: UniqueIdResponse = parse("unique-id", &body)?;
        resp.unique_id
            .parse()
            .map_err(|e| ClientError::Parse(format!("unique-id: {e}")))
    }

    /// Run a command. Transport failures come back as
    /// [`ReplyStatus::CommunicationFailure`].
    pub async fn execute(
        &mut self,
        command: Command,
        token: Option<&CapabilityToken>,
    ) -> ReplyStatus {
        let req = ExecuteRequest {
            command: command.code(),
            token: token.map(|t| hex::encode(t.as_bytes())),
        };
        self.command_call(hyper::Method::POST, "/execute", &req).await
    }

    pub async fn is_supported(&mut self) -> ReplyStatus {
        self.execute(Command::IsSupported, None).await
    }

    pub async fn state(&mut self) -> Result<Option<PowerStateSnapshot>, ClientError> {
        let body = self.request(hyper::Method::GET, "/state", None).await?;
        let resp: StateResponse = parse("state", &body)?;
        Ok(resp.state)
    }

    pub async fn settings(&mut self) -> Result<Option<Settings>, ClientError> {
        let body = self.request(hyper::Method::GET, "/settings", None).await?;
        let resp: SettingsResponse = parse("settings", &body)?;
        Ok(resp.settings)
    }

    pub async fn set_settings(
        &mut self,
        token: Option<&CapabilityToken>,
        settings: Settings,
    ) -> ReplyStatus {
        let req = SetSettingsRequest {
            token: token.map(|t| hex::encode(t.as_bytes())),
            settings,
        };
        self.command_call(hyper::Method::POST, "/settings", &req).await
    }

    async fn command_call<T: Serialize>(
        &mut self,
        method: hyper::Method,
        path: &str,
        req: &T,
    ) -> ReplyStatus {
        let result = async {
            let body = self.request(method, path, Some(encode(req)?)).await?;
            parse::<CommandReply>(path, &body)
        }
        .await;
        match result {
            Ok(reply) => reply.status,
            Err(_) => ReplyStatus::CommunicationFailure,
        }
    }
}

impl DaemonLink for DaemonClient {
    fn unique_id(&mut self) -> BoxFuture<'_, Result<DaemonIdentity, ClientError>> {
        Box::pin(DaemonClient::unique_id(self))
    }

    fn execute<'a>(
        &'a mut self,
        command: Command,
        token: Option<&'a CapabilityToken>,
    ) -> BoxFuture<'a, ReplyStatus> {
        Box::pin(DaemonClient::execute(self, command, token))
    }
}

// ── Authorization client ────────────────────────────────────────────────

/// Requests capability tokens from the authorization service.
pub struct AuthorizationClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl AuthorizationClient {
    pub fn new(socket_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout,
        }
    }

    /// Obtain a fresh token holding every right in `rights`.
    pub async fn request_token(&self, rights: &[Right]) -> Result<CapabilityToken, ClientError> {
        let req = AuthorizeRequest {
            rights: rights.iter().map(|r| r.name().to_string()).collect(),
        };
        let body = encode(&req)?;

        let bytes = tokio::time::timeout(self.timeout, async {
            let mut sender = dial(&self.socket_path).await?;
            round_trip(&mut sender, hyper::Method::POST, "/authorize", Some(body)).await
        })
        .await
        .unwrap_or(Err(ClientError::Timeout(self.timeout)))?;

        let resp: AuthorizeResponse = parse("authorize", &bytes)?;
        let raw = hex::decode(&resp.token).map_err(|e| ClientError::Parse(format!("token: {e}")))?;
        CapabilityToken::from_slice(&raw)
            .ok_or_else(|| ClientError::Parse(format!("token has {} bytes", raw.len())))
    }
}

impl TokenSource for AuthorizationClient {
    fn request_token<'a>(
        &'a mut self,
        rights: &'a [Right],
    ) -> BoxFuture<'a, Result<CapabilityToken, ClientError>> {
        Box::pin(AuthorizationClient::request_token(self, rights))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_not_running_is_communication_failure() {
        let mut client = DaemonClient::new("/tmp/nonexistent-powergate.sock", Duration::from_secs(1));
        assert_eq!(client.is_supported().await, ReplyStatus::CommunicationFailure);
        assert!(matches!(
            client.unique_id().await,
            Err(ClientError::NotRunning(_))
        ));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_authorization_client_not_running() {
        let client =
            AuthorizationClient::new("/tmp/nonexistent-powergate-auth.sock", Duration::from_secs(1));
        assert!(matches!(
            client.request_token(&[Right::ManagePower]).await,
            Err(ClientError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("silent.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();
        let _hold = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let mut client = DaemonClient::new(&path, Duration::from_millis(200));
        assert!(matches!(
            client.health().await,
            Err(ClientError::Timeout(_))
        ));
        assert!(!client.is_connected());
    }
}
