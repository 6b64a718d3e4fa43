//! End-to-end: a real daemon serving both sockets in a temp directory.

use pretty_assertions::assert_eq;
use powergate_core::auth::{CapabilityToken, Right};
use powergate_core::dispatch::{Command, ReplyStatus};
use powergate_core::identity::DaemonIdentity;
use powergate_core::ipc::ClientError;
use powergate_core::power::{Settings, keys};
use powergate_core::registrar::{Registrar, RegistrationState, ServiceStatus};
use powergate_core::SmcClient;
use powergate_test_utils::config::TestConfigBuilder;
use powergate_test_utils::daemon::TestDaemon;
use powergate_test_utils::fakes::{
    FakeDaemonLink, FakeInstaller, FakeServiceManager, StaticTokenSource,
};
use powergate_test_utils::smc::SimulatedSmc;
use powergate_test_utils::tracing_setup::init_test_tracing;

fn identity() -> DaemonIdentity {
    DaemonIdentity::from_bytes(b"daemon under test")
}

#[tokio::test]
async fn test_authorized_command_reaches_hardware() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = TestConfigBuilder::in_dir(dir.path()).grants(&[("*", "*")]).build();
    let sim = SimulatedSmc::power_capable();
    let daemon = TestDaemon::start(config, sim.open_client(), identity()).await;

    let token = daemon
        .authorization_client()
        .request_token(&[Right::ManagePower])
        .await
        .unwrap();
    let mut client = daemon.daemon_client();

    assert_eq!(
        client.execute(Command::DisableCharging, Some(&token)).await,
        ReplyStatus::Success
    );
    assert_eq!(sim.value(keys::CHARGING_B), Some(vec![0x02]));

    let state = client.state().await.unwrap().unwrap();
    assert!(!state.charging_enabled);

    daemon.stop().await;
}

#[tokio::test]
async fn test_modify_only_token_cannot_charge() {
    let dir = tempfile::tempdir().unwrap();
    let config = TestConfigBuilder::in_dir(dir.path())
        .grants(&[("*", Right::ModifySystemDaemons.name())])
        .build();
    let sim = SimulatedSmc::power_capable();
    let daemon = TestDaemon::start(config, sim.open_client(), identity()).await;
    let authority = daemon.authorization_client();

    assert!(matches!(
        authority.request_token(&[Right::ManagePower]).await,
        Err(ClientError::Remote(_))
    ));

    let token = authority
        .request_token(&[Right::ModifySystemDaemons])
        .await
        .unwrap();
    let mut client = daemon.daemon_client();
    assert_eq!(
        client.execute(Command::ChargeToFull, Some(&token)).await,
        ReplyStatus::NotAuthorized
    );
    assert!(sim.writes().is_empty());

    daemon.stop().await;
}

#[tokio::test]
async fn test_token_authorizes_a_single_command() {
    let dir = tempfile::tempdir().unwrap();
    let config = TestConfigBuilder::in_dir(dir.path()).grants(&[("*", "*")]).build();
    let sim = SimulatedSmc::power_capable();
    let daemon = TestDaemon::start(config, sim.open_client(), identity()).await;

    let token = daemon
        .authorization_client()
        .request_token(&[Right::ManagePower])
        .await
        .unwrap();
    let mut client = daemon.daemon_client();

    assert_eq!(
        client.execute(Command::DisablePowerAdapter, Some(&token)).await,
        ReplyStatus::Success
    );
    assert_eq!(
        client.execute(Command::EnablePowerAdapter, Some(&token)).await,
        ReplyStatus::NotAuthorized
    );
    assert_eq!(sim.value(keys::ADAPTER), Some(vec![0x01]));

    daemon.stop().await;
}

#[tokio::test]
async fn test_forged_token_is_not_authorized() {
    let dir = tempfile::tempdir().unwrap();
    let config = TestConfigBuilder::in_dir(dir.path()).grants(&[("*", "*")]).build();
    let sim = SimulatedSmc::power_capable();
    let daemon = TestDaemon::start(config, sim.open_client(), identity()).await;

    let forged = CapabilityToken::new([0xee; 32]);
    let mut client = daemon.daemon_client();
    assert_eq!(
        client.execute(Command::DisablePowerAdapter, Some(&forged)).await,
        ReplyStatus::NotAuthorized
    );
    assert_eq!(
        client
            .set_settings(
                Some(&forged),
                Settings {
                    min_charge: 40,
                    max_charge: 60,
                    adapter_sleep: false,
                }
            )
            .await,
        ReplyStatus::NotAuthorized
    );

    daemon.stop().await;
}

#[tokio::test]
async fn test_unsupported_host_still_answers() {
    let dir = tempfile::tempdir().unwrap();
    let config = TestConfigBuilder::in_dir(dir.path()).build();
    let daemon = TestDaemon::start(config, SmcClient::new(), identity()).await;
    let mut client = daemon.daemon_client();

    assert_eq!(client.is_supported().await, ReplyStatus::Unsupported);
    assert_eq!(client.unique_id().await.unwrap(), identity());
    assert!(!client.health().await.unwrap().supported);
    assert_eq!(client.state().await.unwrap(), None);
    assert_eq!(client.settings().await.unwrap(), None);

    daemon.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_client_recovers_after_daemon_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = TestConfigBuilder::in_dir(dir.path()).build();
    let sim = SimulatedSmc::power_capable();

    let daemon = TestDaemon::start(config.clone(), sim.open_client(), identity()).await;
    let mut client = daemon.daemon_client();
    assert_eq!(client.is_supported().await, ReplyStatus::Success);
    assert!(client.is_connected());

    daemon.stop().await;
    assert_eq!(
        client.is_supported().await,
        ReplyStatus::CommunicationFailure
    );
    assert!(!client.is_connected());

    let daemon = TestDaemon::start(config, sim.open_client(), identity()).await;
    assert_eq!(client.is_supported().await, ReplyStatus::Success);
    assert!(client.is_connected());

    daemon.stop().await;
}

#[tokio::test]
async fn test_disallowed_peer_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let config = TestConfigBuilder::in_dir(dir.path())
        .allowed_uids(vec![u32::MAX - 1])
        .build();
    let daemon = TestDaemon::start(config, SmcClient::new(), identity()).await;

    let mut client = daemon.daemon_client();
    assert_eq!(
        client.is_supported().await,
        ReplyStatus::CommunicationFailure
    );
    assert!(daemon.authorization_client().request_token(&[Right::ManagePower]).await.is_err());

    daemon.stop().await;
}

#[tokio::test]
async fn test_registrar_skips_install_for_running_current_daemon() {
    let dir = tempfile::tempdir().unwrap();
    let config = TestConfigBuilder::in_dir(dir.path()).build();
    let daemon = TestDaemon::start(config, SmcClient::new(), identity()).await;

    let manager = FakeServiceManager::new(ServiceStatus::Enabled);
    let installer = FakeInstaller::new();
    let legacy = powergate_core::registrar::LegacyHelperBackend::new(
        Box::new(installer.clone()),
        Box::new(StaticTokenSource::refusing()),
        Box::new(FakeDaemonLink::unreachable()),
    );
    let backend = powergate_core::registrar::ManagedServiceBackend::new(
        Box::new(manager.clone()),
        legacy,
        &daemon.config.registration,
    );
    let mut registrar = Registrar::new(
        Box::new(backend),
        Box::new(daemon.daemon_client()),
        identity(),
    );

    assert_eq!(registrar.start().await, RegistrationState::Enabled);
    assert_eq!(manager.snapshot().mutations(), 0);
    assert_eq!(installer.snapshot().install_calls, 0);

    daemon.stop().await;
}
