//! Authorization gate for privileged commands.
//!
//! A client proves user authorization with a [`CapabilityToken`]: an opaque
//! blob minted by a privileged broker and sent over the wire as exactly
//! [`EXTERNAL_FORM_LENGTH`] raw bytes. The daemon reconstructs a local
//! [`AuthorizationHandle`] from those bytes and checks named [`Right`]s
//! against it on every command.
//!
//! ```text
//! raw bytes ──from_bytes──▶ AuthorizationHandle ──check_right(Right)──▶ bool
//!    │ (len != 32)                │ (broker says unknown)
//!    └──▶ None                    └──▶ None
//! ```
//!
//! Token bytes are zeroized on drop and never appear in `Debug` output or
//! logs. Right checks are never cached: revoking a token takes effect on the
//! next command. A token that authorized an action is spent through
//! [`PrivilegeBroker::consume`] and cannot authorize another.

pub mod broker;

use std::fmt;
use std::sync::Arc;

use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub use broker::TokenBroker;

/// Wire length of a capability token.
pub const EXTERNAL_FORM_LENGTH: usize = 32;

/// Assert at compile time that a token buffer has the external form length.
///
/// # Example
///
/// ```
/// use powergate_core::auth;
/// auth::assert_external_form::<32>();
/// ```
pub const fn assert_external_form<const N: usize>() {
    assert!(
        N == EXTERNAL_FORM_LENGTH,
        "capability token must be exactly 32 bytes"
    );
}

/// A named privilege class checked against a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Right {
    /// Install, upgrade, or remove the privileged daemon.
    ModifySystemDaemons,
    /// Change charging and power adapter state.
    ManagePower,
}

impl Right {
    pub const ALL: [Right; 2] = [Right::ModifySystemDaemons, Right::ManagePower];

    pub fn name(self) -> &'static str {
        match self {
            Right::ModifySystemDaemons => "powergate.daemons.modify",
            Right::ManagePower => "powergate.power.manage",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.name() == name)
    }
}

impl fmt::Display for Right {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The external form of a capability token.
#[derive(Clone, PartialEq, Eq, Hash, Zeroize, ZeroizeOnDrop)]
pub struct CapabilityToken {
    bytes: [u8; EXTERNAL_FORM_LENGTH],
}

const _: () = assert_external_form::<{ std::mem::size_of::<CapabilityToken>() }>();

impl CapabilityToken {
    pub fn new(bytes: [u8; EXTERNAL_FORM_LENGTH]) -> Self {
        Self { bytes }
    }

    /// Copy a token out of a wire payload. `None` unless the length is exact.
    pub fn from_slice(raw: &[u8]) -> Option<Self> {
        let bytes: [u8; EXTERNAL_FORM_LENGTH] = raw.try_into().ok()?;
        Some(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; EXTERNAL_FORM_LENGTH] {
        &self.bytes
    }
}

impl fmt::Debug for CapabilityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityToken")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A token reconstructed on the daemon side by a [`PrivilegeBroker`].
#[derive(Debug)]
pub struct AuthorizationHandle {
    token: CapabilityToken,
}

impl AuthorizationHandle {
    pub fn new(token: CapabilityToken) -> Self {
        Self { token }
    }

    pub fn token(&self) -> &CapabilityToken {
        &self.token
    }
}

/// The privileged authority that issued tokens and answers right checks.
pub trait PrivilegeBroker: Send + Sync {
    /// Reconstruct a handle from a token the broker issued.
    fn from_external_form(&self, token: CapabilityToken) -> Option<AuthorizationHandle>;

    /// Live check whether `handle` currently holds `right`.
    fn check_right(&self, handle: &AuthorizationHandle, right: Right) -> bool;

    /// Spend a token once it has authorized an action.
    fn consume(&self, handle: AuthorizationHandle);
}

/// Validates wire tokens and checks rights through a broker.
#[derive(Clone)]
pub struct AuthorizationGate {
    broker: Arc<dyn PrivilegeBroker>,
}

impl AuthorizationGate {
    pub fn new(broker: Arc<dyn PrivilegeBroker>) -> Self {
        Self { broker }
    }

    /// Reconstruct a handle from an optional wire payload.
    ///
    /// Missing or wrong-length payloads are rejected without consulting the
    /// broker.
    pub fn from_bytes(&self, raw: Option<&[u8]>) -> Option<AuthorizationHandle> {
        let Some(raw) = raw else {
            debug!("no capability token supplied");
            return None;
        };
        let Some(token) = CapabilityToken::from_slice(raw) else {
            debug!(len = raw.len(), "capability token has wrong length");
            return None;
        };
        self.broker.from_external_form(token)
    }

    pub fn check_right(&self, handle: &AuthorizationHandle, right: Right) -> bool {
        let granted = self.broker.check_right(handle, right);
        debug!(right = %right, granted, "right check");
        granted
    }

    /// Reconstruct, check and spend a token for one action.
    ///
    /// The token is only spent when it holds `right`.
    pub fn authorize(&self, raw: Option<&[u8]>, right: Right) -> bool {
        let Some(handle) = self.from_bytes(raw) else {
            return false;
        };
        if !self.check_right(&handle, right) {
            return false;
        }
        self.broker.consume(handle);
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Accepts every well-formed token and grants only `ManagePower`.
    #[derive(Default)]
    struct CountingBroker {
        reconstructions: AtomicUsize,
        checks: AtomicUsize,
        consumed: AtomicUsize,
    }

    impl PrivilegeBroker for CountingBroker {
        fn from_external_form(&self, token: CapabilityToken) -> Option<AuthorizationHandle> {
            self.reconstructions.fetch_add(1, Ordering::SeqCst);
            Some(AuthorizationHandle::new(token))
        }

        fn check_right(&self, _handle: &AuthorizationHandle, right: Right) -> bool {
            self.checks.fetch_add(1, Ordering::SeqCst);
            right == Right::ManagePower
        }

        fn consume(&self, _handle: AuthorizationHandle) {
            self.consumed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_right_names() {
        assert_eq!(Right::ModifySystemDaemons.name(), "powergate.daemons.modify");
        assert_eq!(Right::ManagePower.to_string(), "powergate.power.manage");
        assert_eq!(
            Right::from_name("powergate.power.manage"),
            Some(Right::ManagePower)
        );
        assert_eq!(Right::from_name("powergate.other"), None);
    }

    #[test]
    fn test_token_debug_is_redacted() {
        let token = CapabilityToken::new([0xAB; EXTERNAL_FORM_LENGTH]);
        let debug = format!("{token:?}");
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("171"));
        assert!(!debug.to_lowercase().contains("ab, ab"));
    }

    #[test]
    fn test_token_from_slice_requires_exact_length() {
        assert!(CapabilityToken::from_slice(&[0u8; 31]).is_none());
        assert!(CapabilityToken::from_slice(&[0u8; 33]).is_none());
        assert!(CapabilityToken::from_slice(&[]).is_none());
        assert!(CapabilityToken::from_slice(&[7u8; 32]).is_some());
    }

    #[test]
    fn test_gate_rejects_malformed_without_broker() {
        let broker = Arc::new(CountingBroker::default());
        let gate = AuthorizationGate::new(broker.clone());

        assert!(gate.from_bytes(None).is_none());
        assert!(gate.from_bytes(Some(&[1u8; 16])).is_none());
        assert!(gate.from_bytes(Some(&[1u8; 64])).is_none());

        assert_eq!(broker.reconstructions.load(Ordering::SeqCst), 0);
        assert_eq!(broker.checks.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_gate_checks_rights_through_broker() {
        let broker = Arc::new(CountingBroker::default());
        let gate = AuthorizationGate::new(broker.clone());

        let handle = gate.from_bytes(Some(&[9u8; 32])).unwrap();
        assert!(gate.check_right(&handle, Right::ManagePower));
        assert!(!gate.check_right(&handle, Right::ModifySystemDaemons));
        assert_eq!(broker.checks.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_authorize_spends_only_granted_tokens() {
        let broker = Arc::new(CountingBroker::default());
        let gate = AuthorizationGate::new(broker.clone());

        assert!(!gate.authorize(Some(&[9u8; 32][..]), Right::ModifySystemDaemons));
        assert!(!gate.authorize(Some(&[9u8; 3][..]), Right::ManagePower));
        assert_eq!(broker.consumed.load(Ordering::SeqCst), 0);

        assert!(gate.authorize(Some(&[9u8; 32][..]), Right::ManagePower));
        assert_eq!(broker.consumed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_token_zeroize_clears_bytes() {
        let mut token = CapabilityToken::new([0x5a; EXTERNAL_FORM_LENGTH]);
        token.zeroize();
        assert_eq!(token.as_bytes(), &[0u8; EXTERNAL_FORM_LENGTH]);
    }

    #[test]
    fn test_compile_time_length_assert() {
        assert_external_form::<EXTERNAL_FORM_LENGTH>();
    }
}
