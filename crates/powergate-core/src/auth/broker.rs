//! In-memory token broker.
//!
//! Mints random capability tokens for a caller's role, records the rights
//! each token was granted, and answers right checks live against that
//! record. A token authorizes a single action and expires after a
//! time-to-live; expired tokens are pruned whenever a new one is minted.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use powergate_config::policy::GrantPolicy;
use rand::Rng;
use tracing::{debug, info, warn};

use super::{AuthorizationHandle, CapabilityToken, EXTERNAL_FORM_LENGTH, PrivilegeBroker, Right};

/// Errors from minting a token.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("no rights requested")]
    NothingRequested,

    #[error("role {role:?} may not be granted {right}")]
    Denied { role: String, right: Right },
}

/// How long an unspent token stays valid.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(300);

struct Grant {
    rights: HashSet<Right>,
    expires: Instant,
}

impl Grant {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires
    }
}

/// Issues tokens according to a [`GrantPolicy`].
pub struct TokenBroker {
    policy: GrantPolicy,
    ttl: Duration,
    issued: Mutex<HashMap<CapabilityToken, Grant>>,
}

impl TokenBroker {
    pub fn new(policy: GrantPolicy) -> Self {
        Self {
            policy,
            ttl: DEFAULT_TOKEN_TTL,
            issued: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Mint a token holding every right in `rights` for a caller in `role`.
    ///
    /// All-or-nothing: if the policy withholds any requested right, no token
    /// is issued.
    pub fn mint(&self, role: &str, rights: &[Right]) -> Result<CapabilityToken, BrokerError> {
        if rights.is_empty() {
            return Err(BrokerError::NothingRequested);
        }
        for &right in rights {
            if !self.policy.is_granted(role, right.name()) {
                warn!(role, right = %right, "right withheld by grant policy");
                return Err(BrokerError::Denied {
                    role: role.to_string(),
                    right,
                });
            }
        }

        let mut bytes = [0u8; EXTERNAL_FORM_LENGTH];
        rand::thread_rng().fill(&mut bytes);
        let token = CapabilityToken::new(bytes);

        let now = Instant::now();
        let mut issued = self.lock();
        let before = issued.len();
        issued.retain(|_, grant| grant.is_live(now));
        if issued.len() < before {
            debug!(pruned = before - issued.len(), "expired capability tokens pruned");
        }
        issued.insert(
            token.clone(),
            Grant {
                rights: rights.iter().copied().collect(),
                expires: now + self.ttl,
            },
        );
        info!(role, rights = ?rights, outstanding = issued.len(), "capability token issued");
        Ok(token)
    }

    /// Forget a token. Later right checks against it fail.
    pub fn revoke(&self, token: &CapabilityToken) -> bool {
        let removed = self.lock().remove(token).is_some();
        if removed {
            info!("capability token revoked");
        }
        removed
    }

    /// Number of tokens issued and not yet spent, revoked or pruned.
    pub fn outstanding(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CapabilityToken, Grant>> {
        // A poisoned map is still consistent: every mutation is a single insert or remove.
        self.issued.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl PrivilegeBroker for TokenBroker {
    fn from_external_form(&self, token: CapabilityToken) -> Option<AuthorizationHandle> {
        let now = Instant::now();
        let mut issued = self.lock();
        match issued.get(&token) {
            Some(grant) if grant.is_live(now) => Some(AuthorizationHandle::new(token)),
            Some(_) => {
                issued.remove(&token);
                warn!("expired capability token presented");
                None
            }
            None => {
                warn!("unknown capability token presented");
                None
            }
        }
    }

    fn check_right(&self, handle: &AuthorizationHandle, right: Right) -> bool {
        let now = Instant::now();
        self.lock()
            .get(handle.token())
            .is_some_and(|grant| grant.is_live(now) && grant.rights.contains(&right))
    }

    fn consume(&self, handle: AuthorizationHandle) {
        if self.lock().remove(handle.token()).is_some() {
            debug!("capability token spent");
        }
    }
}
