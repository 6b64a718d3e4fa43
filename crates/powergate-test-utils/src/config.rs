//! Configuration builders for tests.
//!
//! Use [`TestConfigBuilder`] to create customised [`AppConfig`] values without
//! repeating boilerplate across crate boundaries.

use std::path::Path;

use powergate_config::{AppConfig, GrantRuleConfig};

/// Fluent builder for [`AppConfig`] in tests.
///
/// # Example
///
/// ```ignore
/// let dir = tempfile::tempdir()?;
/// let config = TestConfigBuilder::in_dir(dir.path())
///     .retry_attempts(2)
///     .grant("*", "*")
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
        }
    }

    /// Place sockets and service directories under `dir`, with fast timings.
    pub fn in_dir(dir: &Path) -> Self {
        let path = |name: &str| dir.join(name).display().to_string();
        let mut config = AppConfig::default();
        config.daemon.daemon_socket = path("daemon.sock");
        config.daemon.service_socket = path("service.sock");
        config.daemon.controller_device = path("controller");
        config.daemon.call_timeout_secs = 2;
        config.registration.daemons_dir = path("daemons");
        config.registration.helper_tools_dir = path("tools");
        config.registration.bundled_daemon = path("bundled-daemon");
        config.registration.retry_delay_ms = 10;
        config.registration.approval_poll_ms = 10;
        Self { config }
    }

    pub fn backend(mut self, backend: &str) -> Self {
        self.config.registration.backend = backend.to_string();
        self
    }

    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.config.registration.retry_attempts = attempts;
        self
    }

    pub fn retry_delay_ms(mut self, ms: u64) -> Self {
        self.config.registration.retry_delay_ms = ms;
        self
    }

    pub fn approval_poll_ms(mut self, ms: u64) -> Self {
        self.config.registration.approval_poll_ms = ms;
        self
    }

    /// Replace the default grants with the given `(role, right)` allows.
    pub fn grants(mut self, rules: &[(&str, &str)]) -> Self {
        self.config.auth.grants = rules
            .iter()
            .map(|(role, right)| GrantRuleConfig {
                role: role.to_string(),
                right: right.to_string(),
                effect: "allow".to_string(),
                priority: 0,
            })
            .collect();
        self
    }

    /// Add one allow rule to the current grants.
    pub fn grant(mut self, role: &str, right: &str) -> Self {
        self.config.auth.grants.push(GrantRuleConfig {
            role: role.to_string(),
            right: right.to_string(),
            effect: "allow".to_string(),
            priority: 0,
        });
        self
    }

    pub fn role(mut self, username: &str, role: &str) -> Self {
        self.config
            .auth
            .role_map
            .insert(username.to_string(), role.to_string());
        self
    }

    pub fn allowed_uids(mut self, uids: Vec<u32>) -> Self {
        self.config.daemon.allowed_uids = uids;
        self
    }

    pub fn log_level(mut self, level: &str) -> Self {
        self.config.logging.level = level.to_string();
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
