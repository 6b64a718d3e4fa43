//! Privileged daemon process: startup, socket serving, and shutdown.
//!
//! The daemon opens the hardware controller once, probes for support, and
//! then serves two sockets until a shutdown signal arrives: the command
//! endpoint backed by the [`Dispatcher`] and the authorization service
//! backed by the [`TokenBroker`]. An unsupported host still serves both;
//! hardware commands then reply `Unsupported`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use powergate_config::AppConfig;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::auth::{AuthorizationGate, TokenBroker};
use crate::dispatch::Dispatcher;
use crate::identity::DaemonIdentity;
use crate::ipc::peer::ClientPolicy;
use crate::ipc::server::{AuthorityState, DaemonState, authority_router, daemon_router, serve};
use crate::power::{PowerController, Settings};
use crate::smc::{DeviceService, SmcClient};

/// Shutdown signal sent via broadcast channel.
#[derive(Debug, Clone)]
pub struct ShutdownSignal;

/// The privileged PowerGate daemon.
pub struct Daemon {
    config: AppConfig,
    identity: DaemonIdentity,
    dispatcher: Arc<Dispatcher>,
    broker: Arc<TokenBroker>,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
    _shutdown_rx: broadcast::Receiver<ShutdownSignal>,
}

impl Daemon {
    /// Open the configured controller device and hash the running binary.
    pub fn new(config: AppConfig) -> Result<Self, DaemonError> {
        let mut smc = SmcClient::new();
        let device = DeviceService::new(&config.daemon.controller_device);
        if !smc.open(&device) {
            warn!(device = %device.path().display(), "hardware controller unavailable");
        }
        let identity = DaemonIdentity::current_exe()?;
        Ok(Self::with_controller(config, smc, identity))
    }

    /// Assemble a daemon around an already-opened (or closed) client.
    pub fn with_controller(config: AppConfig, smc: SmcClient, identity: DaemonIdentity) -> Self {
        let supported = PowerController::probe(&smc);
        if supported {
            info!("power management supported on this host");
        } else {
            warn!("power management not supported on this host");
        }

        let controller = PowerController::new(
            Arc::new(smc),
            Settings::from(&config.settings),
            legacy_helper_files(&config),
        );
        let broker = Arc::new(
            TokenBroker::new(config.build_grant_policy()).with_ttl(config.auth.token_ttl()),
        );
        let gate = AuthorizationGate::new(broker.clone());
        let dispatcher = Arc::new(Dispatcher::new(gate, Arc::new(controller), supported));

        let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);
        Self {
            config,
            identity,
            dispatcher,
            broker,
            shutdown_tx,
            _shutdown_rx,
        }
    }

    /// Serve both sockets until shutdown is requested or a server fails.
    pub async fn run(&self) -> Result<(), DaemonError> {
        info!(
            daemon_socket = %self.config.daemon.daemon_socket,
            service_socket = %self.config.daemon.service_socket,
            identity = ?self.identity,
            version = %crate::build_info::version_string(),
            "PowerGate daemon starting"
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut sigterm = signal(SignalKind::terminate())?;
        let policy = ClientPolicy::from_config(&self.config.daemon);

        let daemon_app = daemon_router(Arc::new(DaemonState {
            dispatcher: Arc::clone(&self.dispatcher),
            identity: self.identity,
        }));
        let authority_app = authority_router(Arc::new(AuthorityState {
            broker: Arc::clone(&self.broker),
            config: self.config.clone(),
        }));

        let mut servers = JoinSet::new();
        for (path, app) in [
            (&self.config.daemon.daemon_socket, daemon_app),
            (&self.config.daemon.service_socket, authority_app),
        ] {
            let path = PathBuf::from(path);
            let policy = policy.clone();
            let rx = self.shutdown_tx.subscribe();
            servers.spawn(async move { serve(&path, app, policy, rx).await });
        }

        let outcome = tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, stopping daemon");
                Ok(())
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Ctrl-C received, initiating graceful shutdown");
                Ok(())
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, initiating graceful shutdown");
                Ok(())
            }
            Some(joined) = servers.join_next() => match joined {
                Ok(Ok(())) => Err(DaemonError::Startup("IPC server stopped unexpectedly".to_string())),
                Ok(Err(e)) => Err(DaemonError::Io(e)),
                Err(e) => Err(DaemonError::Startup(format!("IPC server task failed: {e}"))),
            },
        };

        let _ = self.shutdown_tx.send(ShutdownSignal);
        while let Some(joined) = servers.join_next().await {
            if let Ok(Err(e)) = joined {
                warn!(error = %e, "IPC server stopped with error");
            }
        }

        info!("Daemon stopped");
        outcome
    }

    /// Request a graceful shutdown of the daemon.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(ShutdownSignal);
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn identity(&self) -> DaemonIdentity {
        self.identity
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn broker(&self) -> &Arc<TokenBroker> {
        &self.broker
    }
}

/// Files left behind by a legacy helper installation.
pub fn legacy_helper_files(config: &AppConfig) -> Vec<PathBuf> {
    let reg = &config.registration;
    vec![
        Path::new(&reg.helper_tools_dir).join(&reg.legacy_label),
        Path::new(&reg.daemons_dir).join(format!("{}.plist", reg.legacy_label)),
    ]
}

/// Errors from the daemon runtime.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("daemon startup failed: {0}")]
    Startup(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
