//! Daemon test fixture.
//!
//! [`TestDaemon`] runs a real [`Daemon`] serving both sockets in a temp
//! directory, backed by a [`SimulatedSmc`](crate::smc::SimulatedSmc) or an
//! unopened controller client.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use powergate_config::AppConfig;
use powergate_core::daemon::DaemonError;
use powergate_core::identity::DaemonIdentity;
use powergate_core::ipc::{AuthorizationClient, DaemonClient};
use powergate_core::{Daemon, SmcClient};
use tokio::task::JoinHandle;
use tracing::debug;

/// A daemon serving its sockets until [`stop`](TestDaemon::stop) is called.
pub struct TestDaemon {
    pub daemon: Arc<Daemon>,
    pub config: AppConfig,
    handle: JoinHandle<Result<(), DaemonError>>,
}

impl TestDaemon {
    /// Start serving and wait until both sockets accept connections.
    pub async fn start(config: AppConfig, smc: SmcClient, identity: DaemonIdentity) -> Self {
        let daemon = Arc::new(Daemon::with_controller(config.clone(), smc, identity));
        let runner = Arc::clone(&daemon);
        let handle = tokio::spawn(async move { runner.run().await });

        wait_for_socket(Path::new(&config.daemon.daemon_socket)).await;
        wait_for_socket(Path::new(&config.daemon.service_socket)).await;
        debug!(socket = %config.daemon.daemon_socket, "test daemon ready");

        Self {
            daemon,
            config,
            handle,
        }
    }

    pub fn daemon_client(&self) -> DaemonClient {
        DaemonClient::new(&self.config.daemon.daemon_socket, self.timeout())
    }

    pub fn authorization_client(&self) -> AuthorizationClient {
        AuthorizationClient::new(&self.config.daemon.service_socket, self.timeout())
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.daemon.call_timeout_secs)
    }

    /// Shut the daemon down and wait for it to release its sockets.
    pub async fn stop(self) {
        debug!(socket = %self.config.daemon.daemon_socket, "stopping test daemon");
        self.daemon.shutdown();
        self.handle
            .await
            .expect("daemon task panicked")
            .expect("daemon stopped with error");
    }
}

async fn wait_for_socket(path: &Path) {
    for _ in 0..200 {
        if tokio::net::UnixStream::connect(path).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("socket {} never came up", path.display());
}
