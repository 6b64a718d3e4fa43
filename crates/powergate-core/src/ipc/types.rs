//! Shared request/response types for the daemon and authorization sockets.
//!
//! Serialized as JSON. Capability tokens travel hex-encoded; the decoded
//! bytes are handed to the authorization gate unchanged, so any payload
//! that does not decode to exactly 32 bytes is rejected there.

use serde::{Deserialize, Serialize};

use crate::build_info::BuildInfo;
use crate::dispatch::ReplyStatus;
use crate::power::{PowerStateSnapshot, Settings};

/// Daemon health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(flatten)]
    pub build: BuildInfo,
    pub supported: bool,
}

/// Identity of the running daemon binary (hex SHA-256).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniqueIdResponse {
    pub unique_id: String,
}

/// One command for the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub command: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Reply to an [`ExecuteRequest`] or a settings change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReply {
    #[serde(flatten)]
    pub status: ReplyStatus,
}

/// Current power state. Empty when the host is unsupported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateResponse {
    pub state: Option<PowerStateSnapshot>,
}

/// Current settings. Empty when the host is unsupported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsResponse {
    pub settings: Option<Settings>,
}

/// Settings change, gated by the power management right.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetSettingsRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub settings: Settings,
}

/// Token request sent to the authorization service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizeRequest {
    pub rights: Vec<String>,
}

/// Freshly minted token, hex-encoded.
#[derive(Clone, Serialize, Deserialize)]
pub struct AuthorizeResponse {
    pub token: String,
}

impl std::fmt::Debug for AuthorizeResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizeResponse")
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// Generic error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Decode a wire token. Undecodable input becomes an empty payload, which
/// the gate rejects like any other wrong-length token.
pub fn decode_token(token: Option<&str>) -> Option<Vec<u8>> {
    token.map(|t| hex::decode(t).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_reply_is_flat() {
        let reply = CommandReply {
            status: ReplyStatus::NotAuthorized,
        };
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["status"], "not_authorized");
    }

    #[test]
    fn test_execute_request_without_token() {
        let req: ExecuteRequest = serde_json::from_str(r#"{"command":0}"#).unwrap();
        assert_eq!(req.command, 0);
        assert!(req.token.is_none());
    }

    #[test]
    fn test_decode_token() {
        assert_eq!(decode_token(None), None);
        assert_eq!(decode_token(Some("0a0b")), Some(vec![0x0a, 0x0b]));
        assert_eq!(decode_token(Some("not hex")), Some(Vec::new()));
    }

    #[test]
    fn test_authorize_response_debug_redacts() {
        let resp = AuthorizeResponse {
            token: "deadbeef".to_string(),
        };
        assert!(!format!("{resp:?}").contains("deadbeef"));
    }
}
