//! Daemon registrar: install, upgrade, approve and remove the privileged
//! daemon under one of two OS service-management mechanisms.
//!
//! ```text
//! NotRegistered ──register──▶ Enabled | RequiresApproval | NotRegistered
//! RequiresApproval ──approve(T)──▶ Enabled | RequiresApproval
//! * ──upgrade──▶ (register outcomes)
//! * ──unregister──▶ NotRegistered
//! ```
//!
//! The backend is chosen once at startup by [`select_backend`] and never
//! mixed per call. State is always recomputed from the backend, never
//! persisted. Every OS interaction goes through a trait ([`ServiceManager`],
//! [`HelperInstaller`], [`TokenSource`], [`DaemonLink`]) so each platform
//! call can be replaced.

pub mod launchd;
pub mod legacy;
pub mod managed;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use powergate_config::AppConfig;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::BoxFuture;
use crate::auth::{CapabilityToken, Right};
use crate::dispatch::{Command, ReplyStatus};
use crate::identity::DaemonIdentity;
use crate::ipc::{AuthorizationClient, ClientError, DaemonClient};

pub use launchd::{LaunchdHelperInstaller, LaunchdServiceManager};
pub use legacy::{LegacyHelperBackend, LocalAuthority};
pub use managed::ManagedServiceBackend;

/// Caller-facing registration state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationState {
    NotRegistered,
    RequiresApproval,
    /// A daemon of the other mechanism must be migrated first.
    RequiresUpgrade,
    Enabled,
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationState::NotRegistered => write!(f, "not registered"),
            RegistrationState::RequiresApproval => write!(f, "requires approval"),
            RegistrationState::RequiresUpgrade => write!(f, "requires upgrade"),
            RegistrationState::Enabled => write!(f, "enabled"),
        }
    }
}

/// Status reported by the OS service manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    NotRegistered,
    Enabled,
    RequiresApproval,
    NotFound,
}

impl ServiceStatus {
    pub fn is_registered(self) -> bool {
        !matches!(self, ServiceStatus::NotRegistered | ServiceStatus::NotFound)
    }
}

impl From<ServiceStatus> for RegistrationState {
    fn from(status: ServiceStatus) -> Self {
        match status {
            ServiceStatus::Enabled => RegistrationState::Enabled,
            ServiceStatus::RequiresApproval => RegistrationState::RequiresApproval,
            ServiceStatus::NotRegistered | ServiceStatus::NotFound => {
                RegistrationState::NotRegistered
            }
        }
    }
}

/// Errors from OS service-management calls.
#[derive(Debug, thiserror::Error)]
pub enum RegistrarError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("launchctl failed: {0}")]
    Launchctl(String),

    #[error("failed to write service descriptor: {0}")]
    Descriptor(#[from] plist::Error),

    #[error("authorization failed: {0}")]
    Authorization(#[from] ClientError),

    #[error("capability token does not hold {0}")]
    Unauthorized(Right),

    #[error("service management is not available on this host")]
    Unavailable,
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> RegistrarError {
    RegistrarError::Io {
        path: path.into(),
        source,
    }
}

// ── OS collaborators ────────────────────────────────────────────────────

/// The managed-service OS API.
pub trait ServiceManager: Send {
    fn status(&mut self) -> BoxFuture<'_, ServiceStatus>;

    fn register(&mut self) -> BoxFuture<'_, Result<(), RegistrarError>>;

    fn unregister(&mut self) -> BoxFuture<'_, Result<(), RegistrarError>>;

    /// Status of the legacy helper as seen by the service manager.
    fn legacy_status(&mut self) -> BoxFuture<'_, ServiceStatus>;

    /// Show the user where to approve the service.
    fn open_approval_settings(&mut self);
}

/// The legacy one-shot helper installer. Each call is authorized by a token.
pub trait HelperInstaller: Send {
    fn install<'a>(
        &'a mut self,
        token: &'a CapabilityToken,
    ) -> BoxFuture<'a, Result<(), RegistrarError>>;

    fn remove<'a>(
        &'a mut self,
        token: &'a CapabilityToken,
    ) -> BoxFuture<'a, Result<(), RegistrarError>>;

    fn is_installed(&self) -> bool;
}

/// Source of fresh capability tokens.
pub trait TokenSource: Send {
    fn request_token<'a>(
        &'a mut self,
        rights: &'a [Right],
    ) -> BoxFuture<'a, Result<CapabilityToken, ClientError>>;
}

/// Connection to the installed daemon.
pub trait DaemonLink: Send {
    /// Identity of the installed daemon binary.
    fn unique_id(&mut self) -> BoxFuture<'_, Result<DaemonIdentity, ClientError>>;

    fn execute<'a>(
        &'a mut self,
        command: Command,
        token: Option<&'a CapabilityToken>,
    ) -> BoxFuture<'a, ReplyStatus>;
}

// ── Backends ────────────────────────────────────────────────────────────

/// One OS service-management mechanism.
pub trait RegistrationBackend: Send {
    /// Human-readable name (e.g. "managed", "legacy").
    fn name(&self) -> &'static str;

    fn register(&mut self) -> BoxFuture<'_, RegistrationState>;

    /// Wait up to `timeout` for the user to approve the daemon.
    fn approve(&mut self, timeout: Duration) -> BoxFuture<'_, bool>;

    fn unregister(&mut self) -> BoxFuture<'_, bool>;

    fn status(&mut self) -> BoxFuture<'_, RegistrationState>;

    /// Whether artifacts of the other mechanism must be removed first.
    fn needs_migration(&mut self) -> BoxFuture<'_, bool> {
        Box::pin(async { false })
    }
}

/// Which backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackendPreference {
    /// Pick by OS capability.
    #[default]
    Auto,
    Managed,
    Legacy,
}

impl BackendPreference {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(BackendPreference::Auto),
            "managed" => Some(BackendPreference::Managed),
            "legacy" => Some(BackendPreference::Legacy),
            _ => None,
        }
    }
}

impl fmt::Display for BackendPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendPreference::Auto => write!(f, "auto"),
            BackendPreference::Managed => write!(f, "managed"),
            BackendPreference::Legacy => write!(f, "legacy"),
        }
    }
}

/// Resolved backend variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Managed,
    Legacy,
}

/// First OS major version with the managed service API.
pub const MANAGED_MIN_OS_MAJOR: u32 = 13;

/// Resolve a preference against the host's OS major version.
pub fn select_backend(preference: BackendPreference, os_major: Option<u32>) -> BackendKind {
    match preference {
        BackendPreference::Managed => BackendKind::Managed,
        BackendPreference::Legacy => BackendKind::Legacy,
        BackendPreference::Auto => match os_major {
            Some(major) if major >= MANAGED_MIN_OS_MAJOR => BackendKind::Managed,
            Some(_) => BackendKind::Legacy,
            None => {
                warn!("could not determine OS version, falling back to legacy backend");
                BackendKind::Legacy
            }
        },
    }
}

/// Major product version of the host OS, from `sw_vers`.
pub fn os_major_version() -> Option<u32> {
    let output = std::process::Command::new("sw_vers")
        .arg("-productVersion")
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_major(&String::from_utf8_lossy(&output.stdout))
}

fn parse_major(version: &str) -> Option<u32> {
    version.trim().split('.').next()?.parse().ok()
}

/// Build the launchd-backed backend for `kind` from configuration.
pub fn build_backend(kind: BackendKind, config: &AppConfig) -> Box<dyn RegistrationBackend> {
    let timeout = Duration::from_secs(config.daemon.call_timeout_secs);
    let authority = LocalAuthority::for_current_user(config);
    let installer = LaunchdHelperInstaller::from_config(&config.registration, authority.gate());
    let legacy = LegacyHelperBackend::new(
        Box::new(installer),
        Box::new(authority),
        Box::new(DaemonClient::new(&config.daemon.daemon_socket, timeout)),
    )
    .with_daemon_authority(Box::new(AuthorizationClient::new(
        &config.daemon.service_socket,
        timeout,
    )));
    match kind {
        BackendKind::Legacy => Box::new(legacy),
        BackendKind::Managed => Box::new(ManagedServiceBackend::new(
            Box::new(LaunchdServiceManager::from_config(config)),
            legacy,
            &config.registration,
        )),
    }
}

// ── Registrar ───────────────────────────────────────────────────────────

/// Drives the registration state machine over one backend.
pub struct Registrar {
    backend: Box<dyn RegistrationBackend>,
    daemon: Box<dyn DaemonLink>,
    bundled: DaemonIdentity,
}

impl Registrar {
    pub fn new(
        backend: Box<dyn RegistrationBackend>,
        daemon: Box<dyn DaemonLink>,
        bundled: DaemonIdentity,
    ) -> Self {
        Self {
            backend,
            daemon,
            bundled,
        }
    }

    /// Build from configuration, selecting the backend for this host.
    pub fn from_config(config: &AppConfig) -> Result<Self, RegistrarError> {
        let preference =
            BackendPreference::parse(&config.registration.backend).unwrap_or_default();
        let kind = select_backend(preference, os_major_version());
        let bundled_path = PathBuf::from(&config.registration.bundled_daemon);
        let bundled = DaemonIdentity::of_file(&bundled_path).map_err(|e| io_err(bundled_path, e))?;
        info!(backend = ?kind, %preference, "registration backend selected");

        Ok(Self::new(
            build_backend(kind, config),
            Box::new(DaemonClient::new(
                &config.daemon.daemon_socket,
                Duration::from_secs(config.daemon.call_timeout_secs),
            )),
            bundled,
        ))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Ensure the installed daemon is current, registering if needed.
    pub async fn start(&mut self) -> RegistrationState {
        match self.daemon.unique_id().await {
            Ok(installed) if installed == self.bundled => {
                info!(identity = ?installed, "daemon is up to date, skipping install");
                return RegistrationState::Enabled;
            }
            Ok(installed) => {
                info!(installed = ?installed, bundled = ?self.bundled, "installed daemon is stale");
            }
            Err(e) => info!(error = %e, "no installed daemon reachable"),
        }

        if self.backend.needs_migration().await {
            info!("daemon from the other mechanism is installed, upgrade required");
            return RegistrationState::RequiresUpgrade;
        }
        self.register().await
    }

    pub async fn register(&mut self) -> RegistrationState {
        let state = self.backend.register().await;
        info!(backend = self.backend.name(), %state, "register finished");
        state
    }

    /// Remove whatever is active, then register afresh.
    pub async fn upgrade(&mut self) -> RegistrationState {
        if !self.backend.unregister().await {
            warn!("unregister before upgrade failed, registering anyway");
        }
        self.register().await
    }

    pub async fn approve(&mut self, timeout: Duration) -> bool {
        self.backend.approve(timeout).await
    }

    pub async fn unregister(&mut self) -> bool {
        let ok = self.backend.unregister().await;
        info!(backend = self.backend.name(), ok, "unregister finished");
        ok
    }

    pub async fn status(&mut self) -> RegistrationState {
        self.backend.status().await
    }
}
