//! Managed service backend: registration through the OS service manager,
//! with bounded retries and user approval.
//!
//! Registering over an enabled service first unregisters it, so launchd
//! never keeps running the binary it loaded before.

use std::time::Duration;

use powergate_config::RegistrationConfig;
use tracing::{debug, info, warn};

use super::{LegacyHelperBackend, RegistrationBackend, RegistrationState, ServiceManager, ServiceStatus};
use crate::BoxFuture;

pub struct ManagedServiceBackend {
    manager: Box<dyn ServiceManager>,
    legacy: LegacyHelperBackend,
    retry_attempts: u32,
    retry_delay: Duration,
    approval_poll: Duration,
}

impl ManagedServiceBackend {
    pub fn new(
        manager: Box<dyn ServiceManager>,
        legacy: LegacyHelperBackend,
        config: &RegistrationConfig,
    ) -> Self {
        Self {
            manager,
            legacy,
            retry_attempts: config.retry_attempts.max(1),
            retry_delay: config.retry_delay(),
            approval_poll: config.approval_poll(),
        }
    }

    async fn register_inner(&mut self) -> RegistrationState {
        if self.manager.legacy_status().await.is_registered() {
            info!("removing legacy helper before managed registration");
            if !RegistrationBackend::unregister(&mut self.legacy).await {
                warn!("legacy helper removal failed, not registering");
                return RegistrationState::NotRegistered;
            }
        }

        if self.manager.status().await == ServiceStatus::Enabled {
            info!("booting out enabled daemon service before registering");
            if let Err(e) = self.manager.unregister().await {
                warn!(error = %e, "stale service removal failed, not registering");
                return RegistrationState::NotRegistered;
            }
        }

        for attempt in 1..=self.retry_attempts {
            if let Err(e) = self.manager.register().await {
                warn!(attempt, error = %e, "service registration failed");
            }
            let status = self.manager.status().await;
            debug!(attempt, ?status, "service status after registration");
            if status.is_registered() {
                return status.into();
            }
            if attempt < self.retry_attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        warn!(attempts = self.retry_attempts, "service registration gave up");
        RegistrationState::NotRegistered
    }

    async fn approve_inner(&mut self, timeout: Duration) -> bool {
        self.manager.open_approval_settings();
        let poll = self.approval_poll;
        let manager = &mut self.manager;
        let approved = tokio::time::timeout(timeout, async {
            while manager.status().await != ServiceStatus::Enabled {
                tokio::time::sleep(poll).await;
            }
        })
        .await
        .is_ok();

        if approved {
            info!("daemon approved");
        } else {
            warn!(?timeout, "approval not granted in time");
        }
        approved
    }

    async fn unregister_inner(&mut self) -> bool {
        let status = self.manager.status().await;
        if status != ServiceStatus::Enabled {
            info!(?status, "daemon service is not enabled, nothing to unregister");
            return true;
        }
        match self.manager.unregister().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "service unregistration failed");
                false
            }
        }
    }
}

impl RegistrationBackend for ManagedServiceBackend {
    fn name(&self) -> &'static str {
        "managed"
    }

    fn register(&mut self) -> BoxFuture<'_, RegistrationState> {
        Box::pin(self.register_inner())
    }

    fn approve(&mut self, timeout: Duration) -> BoxFuture<'_, bool> {
        Box::pin(self.approve_inner(timeout))
    }

    fn unregister(&mut self) -> BoxFuture<'_, bool> {
        Box::pin(self.unregister_inner())
    }

    fn status(&mut self) -> BoxFuture<'_, RegistrationState> {
        Box::pin(async move { self.manager.status().await.into() })
    }

    fn needs_migration(&mut self) -> BoxFuture<'_, bool> {
        Box::pin(async move { self.manager.legacy_status().await.is_registered() })
    }
}
