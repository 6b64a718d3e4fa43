//! Registrar state machine over fake OS collaborators.

use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use powergate_config::RegistrationConfig;
use powergate_core::auth::CapabilityToken;
use powergate_core::dispatch::Command;
use powergate_core::identity::DaemonIdentity;
use powergate_core::registrar::{
    LegacyHelperBackend, ManagedServiceBackend, Registrar, RegistrationBackend, RegistrationState,
    ServiceStatus,
};
use powergate_test_utils::config::TestConfigBuilder;
use powergate_test_utils::fakes::{
    FakeDaemonLink, FakeInstaller, FakeServiceManager, StaticTokenSource,
};

fn bundled() -> DaemonIdentity {
    DaemonIdentity::from_bytes(b"bundled daemon v2")
}

fn stale() -> DaemonIdentity {
    DaemonIdentity::from_bytes(b"installed daemon v1")
}

fn registration() -> RegistrationConfig {
    TestConfigBuilder::new()
        .retry_attempts(3)
        .retry_delay_ms(5)
        .approval_poll_ms(5)
        .build()
        .registration
}

struct Rig {
    manager: FakeServiceManager,
    installer: FakeInstaller,
    tokens: StaticTokenSource,
    link: FakeDaemonLink,
}

impl Rig {
    fn new(manager: FakeServiceManager, installer: FakeInstaller, link: FakeDaemonLink) -> Self {
        Self {
            manager: manager.with_legacy_installer(installer.clone()),
            installer,
            tokens: StaticTokenSource::granting(CapabilityToken::new([3; 32])),
            link,
        }
    }

    fn legacy(&self) -> LegacyHelperBackend {
        LegacyHelperBackend::new(
            Box::new(self.installer.clone()),
            Box::new(self.tokens.clone()),
            Box::new(self.link.clone()),
        )
    }

    fn managed(&self, config: &RegistrationConfig) -> ManagedServiceBackend {
        ManagedServiceBackend::new(Box::new(self.manager.clone()), self.legacy(), config)
    }

    fn managed_registrar(&self) -> Registrar {
        Registrar::new(
            Box::new(self.managed(&registration())),
            Box::new(self.link.clone()),
            bundled(),
        )
    }

    fn legacy_registrar(&self) -> Registrar {
        Registrar::new(Box::new(self.legacy()), Box::new(self.link.clone()), bundled())
    }
}

// ── start ─────────────────────────────────────────────────────────

#[test_log::test(tokio::test)]
async fn test_start_with_current_daemon_mutates_nothing() {
    let rig = Rig::new(
        FakeServiceManager::new(ServiceStatus::Enabled),
        FakeInstaller::new(),
        FakeDaemonLink::running(bundled()),
    );

    assert_eq!(rig.managed_registrar().start().await, RegistrationState::Enabled);
    assert_eq!(rig.manager.snapshot().mutations(), 0);
    assert_eq!(rig.installer.snapshot().install_calls, 0);
    assert_eq!(rig.tokens.requests(), 0);
}

#[tokio::test]
async fn test_start_with_stale_daemon_registers() {
    let rig = Rig::new(
        FakeServiceManager::new(ServiceStatus::NotRegistered),
        FakeInstaller::new(),
        FakeDaemonLink::running(stale()),
    );

    assert_eq!(rig.managed_registrar().start().await, RegistrationState::Enabled);
    assert_eq!(rig.manager.snapshot().register_calls, 1);
}

#[test_log::test(tokio::test)]
async fn test_start_with_stale_enabled_service_boots_it_out_first() {
    let rig = Rig::new(
        FakeServiceManager::new(ServiceStatus::Enabled),
        FakeInstaller::new(),
        FakeDaemonLink::running(stale()),
    );

    assert_eq!(rig.managed_registrar().start().await, RegistrationState::Enabled);
    let manager = rig.manager.snapshot();
    assert_eq!(manager.calls, vec!["unregister", "register"]);
    assert_eq!(manager.status, ServiceStatus::Enabled);
}

#[tokio::test]
async fn test_stale_service_that_cannot_be_booted_out_is_not_reregistered() {
    let rig = Rig::new(
        FakeServiceManager::new(ServiceStatus::Enabled).failing_unregister(),
        FakeInstaller::new(),
        FakeDaemonLink::running(stale()),
    );

    assert_eq!(
        rig.managed_registrar().start().await,
        RegistrationState::NotRegistered
    );
    assert_eq!(rig.manager.snapshot().calls, vec!["unregister"]);
}

#[tokio::test]
async fn test_start_with_legacy_helper_requires_upgrade() {
    let rig = Rig::new(
        FakeServiceManager::new(ServiceStatus::NotRegistered),
        FakeInstaller::installed(),
        FakeDaemonLink::running(stale()),
    );

    assert_eq!(
        rig.managed_registrar().start().await,
        RegistrationState::RequiresUpgrade
    );
    assert_eq!(rig.manager.snapshot().mutations(), 0);
    assert!(rig.installer.snapshot().installed);
}

#[tokio::test]
async fn test_start_legacy_backend_installs_with_token() {
    let rig = Rig::new(
        FakeServiceManager::new(ServiceStatus::NotFound),
        FakeInstaller::new(),
        FakeDaemonLink::unreachable(),
    );

    assert_eq!(rig.legacy_registrar().start().await, RegistrationState::Enabled);
    assert_eq!(rig.tokens.requests(), 1);
    assert_eq!(rig.installer.snapshot().install_calls, 1);
}

// ── upgrade ───────────────────────────────────────────────────────

#[test_log::test(tokio::test)]
async fn test_upgrade_migrates_legacy_helper_to_managed_service() {
    let rig = Rig::new(
        FakeServiceManager::new(ServiceStatus::NotRegistered),
        FakeInstaller::installed(),
        FakeDaemonLink::running(stale()),
    );
    let mut registrar = rig.managed_registrar();

    assert_eq!(registrar.start().await, RegistrationState::RequiresUpgrade);
    assert_eq!(registrar.upgrade().await, RegistrationState::Enabled);

    let installer = rig.installer.snapshot();
    assert!(!installer.installed);
    assert_eq!(installer.remove_calls, 1);
    assert_eq!(
        rig.link.snapshot().executed,
        vec![Command::RemoveLegacyHelperFiles]
    );

    let manager = rig.manager.snapshot();
    assert_eq!(manager.register_calls, 1);
    assert_eq!(manager.unregister_calls, 0);
    assert_eq!(registrar.status().await, RegistrationState::Enabled);
}

#[tokio::test]
async fn test_failed_legacy_removal_blocks_managed_registration() {
    let rig = Rig::new(
        FakeServiceManager::new(ServiceStatus::NotRegistered),
        FakeInstaller::installed().failing(),
        FakeDaemonLink::running(stale()),
    );

    assert_eq!(
        rig.managed_registrar().upgrade().await,
        RegistrationState::NotRegistered
    );
    assert_eq!(rig.manager.snapshot().register_calls, 0);
}

// ── register retries ──────────────────────────────────────────────

#[tokio::test]
async fn test_register_retries_until_registered() {
    let rig = Rig::new(
        FakeServiceManager::new(ServiceStatus::NotRegistered).failing_registers(2),
        FakeInstaller::new(),
        FakeDaemonLink::unreachable(),
    );

    assert_eq!(rig.managed_registrar().register().await, RegistrationState::Enabled);
    assert_eq!(rig.manager.snapshot().register_calls, 3);
}

#[tokio::test]
async fn test_register_gives_up_after_configured_attempts() {
    let rig = Rig::new(
        FakeServiceManager::new(ServiceStatus::NotRegistered).failing_registers(10),
        FakeInstaller::new(),
        FakeDaemonLink::unreachable(),
    );

    assert_eq!(
        rig.managed_registrar().register().await,
        RegistrationState::NotRegistered
    );
    assert_eq!(rig.manager.snapshot().register_calls, 3);
}

#[tokio::test]
async fn test_register_pending_approval() {
    let rig = Rig::new(
        FakeServiceManager::new(ServiceStatus::NotRegistered).never_enables(),
        FakeInstaller::new(),
        FakeDaemonLink::unreachable(),
    );

    assert_eq!(
        rig.managed_registrar().register().await,
        RegistrationState::RequiresApproval
    );
    assert_eq!(rig.manager.snapshot().register_calls, 1);
}

// ── approve ───────────────────────────────────────────────────────

#[test_log::test(tokio::test)]
async fn test_approve_times_out_without_user_action() {
    let rig = Rig::new(
        FakeServiceManager::new(ServiceStatus::RequiresApproval).never_enables(),
        FakeInstaller::new(),
        FakeDaemonLink::unreachable(),
    );
    let mut registrar = rig.managed_registrar();

    let started = Instant::now();
    assert!(!registrar.approve(Duration::from_secs(1)).await);
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(1), "returned after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "returned after {elapsed:?}");
    assert_eq!(rig.manager.snapshot().approval_prompts, 1);
    assert_eq!(registrar.status().await, RegistrationState::RequiresApproval);
}

#[tokio::test]
async fn test_approve_returns_once_enabled() {
    let rig = Rig::new(
        FakeServiceManager::new(ServiceStatus::RequiresApproval).approves_after(3),
        FakeInstaller::new(),
        FakeDaemonLink::unreachable(),
    );

    assert!(rig.managed_registrar().approve(Duration::from_secs(5)).await);
    assert!(rig.manager.snapshot().status_calls >= 4);
}

#[tokio::test]
async fn test_legacy_backend_cannot_approve() {
    let rig = Rig::new(
        FakeServiceManager::new(ServiceStatus::NotFound),
        FakeInstaller::installed(),
        FakeDaemonLink::unreachable(),
    );
    assert!(!rig.legacy_registrar().approve(Duration::from_secs(1)).await);
}

// ── unregister ────────────────────────────────────────────────────

#[tokio::test]
async fn test_unregister_when_not_enabled_is_a_no_op() {
    let rig = Rig::new(
        FakeServiceManager::new(ServiceStatus::RequiresApproval),
        FakeInstaller::new(),
        FakeDaemonLink::unreachable(),
    );

    assert!(rig.managed_registrar().unregister().await);
    assert_eq!(rig.manager.snapshot().unregister_calls, 0);
}

#[tokio::test]
async fn test_unregister_enabled_service() {
    let rig = Rig::new(
        FakeServiceManager::new(ServiceStatus::Enabled),
        FakeInstaller::new(),
        FakeDaemonLink::running(bundled()),
    );
    let mut registrar = rig.managed_registrar();

    assert!(registrar.unregister().await);
    assert_eq!(rig.manager.snapshot().unregister_calls, 1);
    assert_eq!(registrar.status().await, RegistrationState::NotRegistered);
}

#[tokio::test]
async fn test_legacy_unregister_without_helper_needs_no_token() {
    let rig = Rig::new(
        FakeServiceManager::new(ServiceStatus::NotFound),
        FakeInstaller::new(),
        FakeDaemonLink::unreachable(),
    );

    assert!(rig.legacy_registrar().unregister().await);
    assert_eq!(rig.tokens.requests(), 0);
}

#[tokio::test]
async fn test_legacy_register_without_authorization_fails() {
    let installer = FakeInstaller::new();
    let mut backend = LegacyHelperBackend::new(
        Box::new(installer.clone()),
        Box::new(StaticTokenSource::refusing()),
        Box::new(FakeDaemonLink::unreachable()),
    );

    assert_eq!(backend.register().await, RegistrationState::NotRegistered);
    assert_eq!(installer.snapshot().install_calls, 0);
}
