//! Legacy helper backend: one-shot installation authorized by a token.

use std::sync::Arc;
use std::time::Duration;

use powergate_config::AppConfig;
use tracing::{error, info, warn};

use super::{
    DaemonLink, HelperInstaller, RegistrationBackend, RegistrationState, TokenSource,
};
use crate::BoxFuture;
use crate::auth::{AuthorizationGate, CapabilityToken, Right, TokenBroker};
use crate::dispatch::Command;
use crate::ipc::ClientError;
use crate::sys;

const MODIFY: [Right; 1] = [Right::ModifySystemDaemons];

pub struct LegacyHelperBackend {
    installer: Box<dyn HelperInstaller>,
    tokens: Box<dyn TokenSource>,
    daemon: Box<dyn DaemonLink>,
    daemon_tokens: Option<Box<dyn TokenSource>>,
}

impl LegacyHelperBackend {
    /// `tokens` authorizes the installer. It also authorizes the daemon's
    /// file removal unless [`with_daemon_authority`](Self::with_daemon_authority)
    /// names a separate source.
    pub fn new(
        installer: Box<dyn HelperInstaller>,
        tokens: Box<dyn TokenSource>,
        daemon: Box<dyn DaemonLink>,
    ) -> Self {
        Self {
            installer,
            tokens,
            daemon,
            daemon_tokens: None,
        }
    }

    /// Source of tokens the running daemon recognises.
    pub fn with_daemon_authority(mut self, tokens: Box<dyn TokenSource>) -> Self {
        self.daemon_tokens = Some(tokens);
        self
    }

    pub fn is_installed(&self) -> bool {
        self.installer.is_installed()
    }

    async fn register_inner(&mut self) -> RegistrationState {
        let Some(token) = modify_token(self.tokens.as_mut()).await else {
            return RegistrationState::NotRegistered;
        };
        match self.installer.install(&token).await {
            Ok(()) => {
                info!("legacy helper installed");
                RegistrationState::Enabled
            }
            Err(e) => {
                warn!(error = %e, "legacy helper installation failed");
                RegistrationState::NotRegistered
            }
        }
    }

    async fn unregister_inner(&mut self) -> bool {
        if !self.installer.is_installed() {
            info!("legacy helper is not installed");
            return true;
        }

        let daemon_source = match self.daemon_tokens.as_deref_mut() {
            Some(source) => source,
            None => self.tokens.as_mut(),
        };
        match modify_token(daemon_source).await {
            Some(token) => {
                let status = self
                    .daemon
                    .execute(Command::RemoveLegacyHelperFiles, Some(&token))
                    .await;
                if !status.is_success() {
                    warn!(%status, "helper did not remove its files");
                }
            }
            None => warn!("skipping helper file removal"),
        }

        let Some(token) = modify_token(self.tokens.as_mut()).await else {
            return false;
        };
        match self.installer.remove(&token).await {
            Ok(()) => {
                info!("legacy helper removed");
                true
            }
            Err(e) => {
                warn!(error = %e, "legacy helper removal failed");
                false
            }
        }
    }
}

async fn modify_token(source: &mut dyn TokenSource) -> Option<CapabilityToken> {
    match source.request_token(&MODIFY).await {
        Ok(token) => Some(token),
        Err(e) => {
            warn!(error = %e, "could not obtain authorization");
            None
        }
    }
}

impl RegistrationBackend for LegacyHelperBackend {
    fn name(&self) -> &'static str {
        "legacy"
    }

    fn register(&mut self) -> BoxFuture<'_, RegistrationState> {
        Box::pin(self.register_inner())
    }

    fn approve(&mut self, _timeout: Duration) -> BoxFuture<'_, bool> {
        Box::pin(async {
            error!("legacy helper has no approval step");
            false
        })
    }

    fn unregister(&mut self) -> BoxFuture<'_, bool> {
        Box::pin(self.unregister_inner())
    }

    fn status(&mut self) -> BoxFuture<'_, RegistrationState> {
        let state = if self.installer.is_installed() {
            RegistrationState::Enabled
        } else {
            RegistrationState::NotRegistered
        };
        Box::pin(async move { state })
    }
}

// ── Local authority ─────────────────────────────────────────────────────

/// Mints tokens in-process for the calling user.
///
/// Authorizes legacy installation and removal, which happen with no daemon
/// around to host the authorization service. The installer verifies these
/// tokens against the same broker through [`LocalAuthority::gate`]; the
/// daemon does not recognise them.
pub struct LocalAuthority {
    broker: Arc<TokenBroker>,
    role: String,
}

impl LocalAuthority {
    pub fn new(broker: TokenBroker, role: impl Into<String>) -> Self {
        Self {
            broker: Arc::new(broker),
            role: role.into(),
        }
    }

    /// Resolve the caller's role from the process uid and its user database
    /// entry.
    pub fn for_current_user(config: &AppConfig) -> Self {
        let uid = sys::current_uid();
        let username = sys::username(uid).unwrap_or_else(|| format!("uid:{uid}"));
        Self::new(
            TokenBroker::new(config.build_grant_policy()).with_ttl(config.auth.token_ttl()),
            config.role_for(&username, uid),
        )
    }

    /// A gate that accepts the tokens this authority mints.
    pub fn gate(&self) -> AuthorizationGate {
        AuthorizationGate::new(self.broker.clone())
    }
}

impl TokenSource for LocalAuthority {
    fn request_token<'a>(
        &'a mut self,
        rights: &'a [Right],
    ) -> BoxFuture<'a, Result<CapabilityToken, ClientError>> {
        let result = self
            .broker
            .mint(&self.role, rights)
            .map_err(|e| ClientError::Remote(e.to_string()));
        Box::pin(async move { result })
    }
}
