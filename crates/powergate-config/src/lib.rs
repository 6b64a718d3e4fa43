#![deny(unsafe_code)]

//! Configuration loading, validation, and right-grant policy for PowerGate.
//!
//! Loads TOML configuration files and validates them against expected schemas.
//! Provides the [`AppConfig`] type as the central configuration structure,
//! and the [`policy`] module deciding which rights the authorization broker
//! may grant.

/// Role-based right-grant policy.
pub mod policy;

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level application configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Daemon and IPC endpoint configuration.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Daemon installation / registration configuration.
    #[serde(default)]
    pub registration: RegistrationConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Authorization broker configuration.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Initial charge settings applied by the daemon.
    #[serde(default)]
    pub settings: ChargeSettingsConfig,
}

/// Configuration for the privileged daemon and its IPC endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Unix socket the privileged daemon serves commands on.
    #[serde(default = "default_daemon_socket")]
    pub daemon_socket: String,

    /// Unix socket the authorization service hands out tokens on.
    #[serde(default = "default_service_socket")]
    pub service_socket: String,

    /// Device node of the hardware controller. Absent node = unsupported host.
    #[serde(default = "default_controller_device")]
    pub controller_device: String,

    /// UIDs allowed to connect. Empty = any local user.
    #[serde(default)]
    pub allowed_uids: Vec<u32>,

    /// Executables allowed to connect. Empty = any executable.
    #[serde(default)]
    pub allowed_executables: Vec<String>,

    /// Client-side timeout for a single daemon call, in seconds.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            daemon_socket: default_daemon_socket(),
            service_socket: default_service_socket(),
            controller_device: default_controller_device(),
            allowed_uids: Vec::new(),
            allowed_executables: Vec::new(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

fn default_daemon_socket() -> String {
    "/var/run/powergate/daemon.sock".to_string()
}

fn default_service_socket() -> String {
    "/var/run/powergate/service.sock".to_string()
}

fn default_controller_device() -> String {
    "/dev/powergate-smc".to_string()
}

fn default_call_timeout_secs() -> u64 {
    5
}

/// Daemon registration configuration.
///
/// ## TOML Example
///
/// ```toml
/// [registration]
/// backend = "managed"
/// retry_attempts = 3
/// retry_delay_ms = 1000
/// approval_timeout_secs = 20
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationConfig {
    /// Registration backend: "auto", "managed", or "legacy".
    #[serde(default = "default_backend")]
    pub backend: String,

    /// launchd label of the managed daemon service.
    #[serde(default = "default_daemon_label")]
    pub daemon_label: String,

    /// launchd label of the legacy privileged helper.
    #[serde(default = "default_legacy_label")]
    pub legacy_label: String,

    /// Path of the daemon binary bundled with the client.
    #[serde(default = "default_bundled_daemon")]
    pub bundled_daemon: String,

    /// Directory holding service descriptors.
    #[serde(default = "default_daemons_dir")]
    pub daemons_dir: String,

    /// Directory the legacy helper binary is installed into.
    #[serde(default = "default_helper_tools_dir")]
    pub helper_tools_dir: String,

    /// Activation attempts before registration gives up.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Pause between activation attempts, in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// How long to wait for the user to approve the daemon, in seconds.
    #[serde(default = "default_approval_timeout_secs")]
    pub approval_timeout_secs: u64,

    /// Status poll interval while waiting for approval, in milliseconds.
    #[serde(default = "default_approval_poll_ms")]
    pub approval_poll_ms: u64,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            daemon_label: default_daemon_label(),
            legacy_label: default_legacy_label(),
            bundled_daemon: default_bundled_daemon(),
            daemons_dir: default_daemons_dir(),
            helper_tools_dir: default_helper_tools_dir(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            approval_timeout_secs: default_approval_timeout_secs(),
            approval_poll_ms: default_approval_poll_ms(),
        }
    }
}

impl RegistrationConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_secs)
    }

    pub fn approval_poll(&self) -> Duration {
        Duration::from_millis(self.approval_poll_ms)
    }
}

fn default_backend() -> String {
    "auto".to_string()
}

fn default_daemon_label() -> String {
    "dev.powergate.daemon".to_string()
}

fn default_legacy_label() -> String {
    "dev.powergate.helper".to_string()
}

fn default_bundled_daemon() -> String {
    "/Applications/PowerGate.app/Contents/Library/LaunchServices/dev.powergate.daemon".to_string()
}

fn default_daemons_dir() -> String {
    "/Library/LaunchDaemons".to_string()
}

fn default_helper_tools_dir() -> String {
    "/Library/PrivilegedHelperTools".to_string()
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_approval_timeout_secs() -> u64 {
    20
}

fn default_approval_poll_ms() -> u64 {
    250
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Authorization broker configuration.
///
/// The broker maps the connecting user to a role (root is always "admin")
/// and grants each requested right the policy allows.
///
/// ## TOML Example
///
/// ```toml
/// [auth.role_map]
/// alice = "admin"
/// bob = "staff"
///
/// [[auth.grants]]
/// role = "staff"
/// right = "powergate.power.manage"
/// effect = "allow"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Mapping of OS usernames to grant roles.
    #[serde(default)]
    pub role_map: HashMap<String, String>,

    /// Grant rules.
    #[serde(default = "default_grants")]
    pub grants: Vec<GrantRuleConfig>,

    /// Seconds an unspent capability token stays valid.
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            role_map: HashMap::new(),
            grants: default_grants(),
            token_ttl_secs: default_token_ttl_secs(),
        }
    }
}

impl AuthConfig {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}

fn default_token_ttl_secs() -> u64 {
    300
}

/// A single grant rule as expressed in TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantRuleConfig {
    /// Role (e.g. "admin", "staff", "*").
    pub role: String,
    /// Right name or "*".
    pub right: String,
    /// Effect ("allow" or "deny").
    pub effect: String,
    /// Priority (higher = evaluated first).
    #[serde(default)]
    pub priority: u32,
}

fn default_grants() -> Vec<GrantRuleConfig> {
    vec![GrantRuleConfig {
        role: "admin".to_string(),
        right: "*".to_string(),
        effect: "allow".to_string(),
        priority: 0,
    }]
}

/// Initial charge settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeSettingsConfig {
    /// Charge level below which charging resumes.
    #[serde(default = "default_min_charge")]
    pub min_charge: u8,

    /// Charge level at which charging stops.
    #[serde(default = "default_max_charge")]
    pub max_charge: u8,

    /// Whether the power adapter is disabled while the machine sleeps.
    #[serde(default)]
    pub adapter_sleep: bool,
}

impl Default for ChargeSettingsConfig {
    fn default() -> Self {
        Self {
            min_charge: default_min_charge(),
            max_charge: default_max_charge(),
            adapter_sleep: false,
        }
    }
}

/// Lowest charge limit the daemon accepts.
pub const MIN_CHARGE_LIMIT: u8 = 20;

/// Highest charge limit the daemon accepts.
pub const MAX_CHARGE_LIMIT: u8 = 100;

fn default_min_charge() -> u8 {
    70
}

fn default_max_charge() -> u8 {
    80
}

impl AppConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), backend = %config.registration.backend, "configuration loaded");
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.daemon_socket.is_empty() {
            return Err(ConfigError::Validation(
                "daemon.daemon_socket must not be empty".to_string(),
            ));
        }
        if self.daemon.service_socket.is_empty() {
            return Err(ConfigError::Validation(
                "daemon.service_socket must not be empty".to_string(),
            ));
        }
        if self.daemon.daemon_socket == self.daemon.service_socket {
            return Err(ConfigError::Validation(
                "daemon.daemon_socket and daemon.service_socket must differ".to_string(),
            ));
        }
        if self.daemon.call_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "daemon.call_timeout_secs must be non-zero".to_string(),
            ));
        }

        let reg = &self.registration;
        let valid_backends = ["auto", "managed", "legacy"];
        if !valid_backends.contains(&reg.backend.as_str()) {
            return Err(ConfigError::Validation(format!(
                "registration.backend must be one of {:?}, got {:?}",
                valid_backends, reg.backend
            )));
        }
        if reg.daemon_label.is_empty() || reg.legacy_label.is_empty() {
            return Err(ConfigError::Validation(
                "registration labels must not be empty".to_string(),
            ));
        }
        if reg.daemon_label == reg.legacy_label {
            return Err(ConfigError::Validation(
                "registration.daemon_label and registration.legacy_label must differ".to_string(),
            ));
        }
        if reg.retry_attempts == 0 {
            return Err(ConfigError::Validation(
                "registration.retry_attempts must be at least 1".to_string(),
            ));
        }
        if reg.approval_poll_ms == 0 {
            return Err(ConfigError::Validation(
                "registration.approval_poll_ms must be non-zero".to_string(),
            ));
        }

        if self.auth.token_ttl_secs == 0 {
            return Err(ConfigError::Validation(
                "auth.token_ttl_secs must be non-zero".to_string(),
            ));
        }
        for (i, rule) in self.auth.grants.iter().enumerate() {
            if rule.effect != "allow" && rule.effect != "deny" {
                return Err(ConfigError::Validation(format!(
                    "auth.grants[{i}].effect must be \"allow\" or \"deny\", got {:?}",
                    rule.effect
                )));
            }
            if rule.role.is_empty() || rule.right.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "auth.grants[{i}] role and right must not be empty"
                )));
            }
        }

        let s = &self.settings;
        if s.min_charge < MIN_CHARGE_LIMIT || s.max_charge > MAX_CHARGE_LIMIT {
            return Err(ConfigError::Validation(format!(
                "settings charge limits must lie within [{MIN_CHARGE_LIMIT}, {MAX_CHARGE_LIMIT}]"
            )));
        }
        if s.min_charge > s.max_charge {
            return Err(ConfigError::Validation(format!(
                "settings.min_charge ({}) must not exceed settings.max_charge ({})",
                s.min_charge, s.max_charge
            )));
        }

        Ok(())
    }

    /// Build a [`GrantPolicy`](policy::GrantPolicy) from the configured rules.
    pub fn build_grant_policy(&self) -> policy::GrantPolicy {
        let rules = self
            .auth
            .grants
            .iter()
            .map(|r| {
                let rule = if r.effect == "allow" {
                    policy::GrantRule::allow(&r.role, &r.right)
                } else {
                    policy::GrantRule::deny(&r.role, &r.right)
                };
                rule.with_priority(r.priority)
            })
            .collect();
        policy::build_policy(rules)
    }

    /// Resolve the grant role of a local user.
    ///
    /// Root is always `"admin"`; otherwise the role map is consulted and
    /// the username itself is the fallback role.
    pub fn role_for(&self, username: &str, uid: u32) -> String {
        if uid == 0 {
            return "admin".to_string();
        }
        self.auth
            .role_map
            .get(username)
            .cloned()
            .unwrap_or_else(|| username.to_string())
    }
}
