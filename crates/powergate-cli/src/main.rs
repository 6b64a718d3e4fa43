#![deny(unsafe_code)]

//! PowerGate CLI: runs the privileged daemon and drives it as a client.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use powergate_config::AppConfig;
use powergate_core::dispatch::{Command as DaemonCommand, ReplyStatus};
use powergate_core::ipc::{AuthorizationClient, DaemonClient};
use powergate_core::power::Settings;
use powergate_core::registrar::{Registrar, RegistrationState};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// PowerGate: privileged battery charging control.
#[derive(Parser)]
#[command(name = "powergate", version = powergate_core::build_info::VERSION, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "/etc/powergate/powergate.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the privileged daemon in the foreground.
    Daemon,

    /// Make sure the installed daemon is current, installing it if needed.
    Start,

    /// Remove the installed daemon and register the bundled one.
    Upgrade,

    /// Wait for the user to approve the daemon in system settings.
    Approve {
        /// Seconds to wait before giving up.
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Remove the installed daemon.
    Unregister,

    /// Show registration and daemon status.
    Status,

    /// Send one command to the daemon (e.g. `disable-charging`).
    Exec {
        #[arg(value_parser = parse_daemon_command)]
        command: DaemonCommand,
    },

    /// Show or change charge settings.
    Settings {
        #[arg(long, requires = "max")]
        min: Option<u8>,

        #[arg(long, requires = "min")]
        max: Option<u8>,

        /// Disable the power adapter while the machine sleeps.
        #[arg(long)]
        adapter_sleep: Option<bool>,
    },

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },
}

fn parse_daemon_command(name: &str) -> Result<DaemonCommand, String> {
    DaemonCommand::from_name(name).ok_or_else(|| {
        let names: Vec<&str> = DaemonCommand::ALL.iter().map(|c| c.name()).collect();
        format!("unknown command {name:?}; expected one of {}", names.join(", "))
    })
}

fn log_filter(verbose: u8, configured: &str) -> String {
    match verbose {
        0 => configured.to_string(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, from_file) = load_config(&cli.config).await?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(log_filter(cli.verbose, &config.logging.level))),
        )
        .init();
    if !from_file {
        info!(path = %cli.config.display(), "Config file not found, using defaults");
    }

    match cli.command {
        Commands::Daemon => cmd_daemon(config).await?,
        Commands::Start => cmd_start(&config).await?,
        Commands::Upgrade => cmd_upgrade(&config).await?,
        Commands::Approve { timeout } => cmd_approve(&config, timeout).await?,
        Commands::Unregister => cmd_unregister(&config).await?,
        Commands::Status => cmd_status(&config).await?,
        Commands::Exec { command } => cmd_exec(&config, command).await?,
        Commands::Settings {
            min,
            max,
            adapter_sleep,
        } => cmd_settings(&config, min.zip(max), adapter_sleep).await?,
        Commands::Config { show } => cmd_config(&config, &cli.config, show)?,
    }

    Ok(())
}

// ── Daemon ──────────────────────────────────────────────────────────────

async fn cmd_daemon(config: AppConfig) -> Result<()> {
    info!(version = %powergate_core::build_info::version_string(), "Starting PowerGate daemon");
    let daemon = powergate_core::Daemon::new(config).context("daemon startup failed")?;
    daemon.run().await?;
    Ok(())
}

// ── Registration ────────────────────────────────────────────────────────

fn registrar(config: &AppConfig) -> Result<Registrar> {
    let registrar = Registrar::from_config(config).context("cannot set up registration")?;
    info!(backend = registrar.backend_name(), "registration backend");
    Ok(registrar)
}

fn report(state: RegistrationState) -> Result<()> {
    println!("daemon: {state}");
    match state {
        RegistrationState::Enabled => Ok(()),
        RegistrationState::RequiresApproval => {
            println!("Approve the daemon in System Settings, then run `powergate approve`.");
            Ok(())
        }
        RegistrationState::RequiresUpgrade => {
            println!("An older daemon is installed; run `powergate upgrade`.");
            Ok(())
        }
        RegistrationState::NotRegistered => bail!("daemon is not registered"),
    }
}

async fn cmd_start(config: &AppConfig) -> Result<()> {
    let state = registrar(config)?.start().await;
    report(state)
}

async fn cmd_upgrade(config: &AppConfig) -> Result<()> {
    let state = registrar(config)?.upgrade().await;
    report(state)
}

async fn cmd_approve(config: &AppConfig, timeout: Option<u64>) -> Result<()> {
    let timeout = timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.registration.approval_timeout());
    if registrar(config)?.approve(timeout).await {
        println!("daemon approved");
        Ok(())
    } else {
        bail!("daemon was not approved within {timeout:?}")
    }
}

async fn cmd_unregister(config: &AppConfig) -> Result<()> {
    if registrar(config)?.unregister().await {
        println!("daemon removed");
        Ok(())
    } else {
        bail!("failed to remove daemon")
    }
}

async fn cmd_status(config: &AppConfig) -> Result<()> {
    match Registrar::from_config(config) {
        Ok(mut registrar) => println!(
            "registration ({}): {}",
            registrar.backend_name(),
            registrar.status().await
        ),
        Err(e) => warn!(error = %e, "registration status unavailable"),
    }

    let mut client = daemon_client(config);
    match client.health().await {
        Ok(health) => {
            println!(
                "daemon: running {} ({}, {})",
                health.build.version, health.build.git_hash, health.build.build_profile
            );
            println!("supported: {}", health.supported);
        }
        Err(e) => {
            println!("daemon: not reachable ({e})");
            return Ok(());
        }
    }
    if let Some(state) = client.state().await? {
        println!("charging: {}", on_off(state.charging_enabled));
        println!("power adapter: {}", on_off(state.power_adapter_enabled));
        println!("charge mode: {:?}", state.charge_mode);
        if state.updating {
            println!("update in progress");
        }
    }
    Ok(())
}

fn on_off(enabled: bool) -> &'static str {
    if enabled { "enabled" } else { "disabled" }
}

// ── Commands ────────────────────────────────────────────────────────────

fn call_timeout(config: &AppConfig) -> Duration {
    Duration::from_secs(config.daemon.call_timeout_secs)
}

fn daemon_client(config: &AppConfig) -> DaemonClient {
    DaemonClient::new(&config.daemon.daemon_socket, call_timeout(config))
}

fn expect_success(status: ReplyStatus) -> Result<()> {
    println!("{status}");
    if status.is_success() {
        Ok(())
    } else {
        bail!("daemon replied: {status}")
    }
}

async fn cmd_exec(config: &AppConfig, command: DaemonCommand) -> Result<()> {
    let token = match command.required_right() {
        Some(right) => Some(
            AuthorizationClient::new(&config.daemon.service_socket, call_timeout(config))
                .request_token(&[right])
                .await
                .with_context(|| format!("authorization for {right} failed"))?,
        ),
        None => None,
    };
    let status = daemon_client(config).execute(command, token.as_ref()).await;
    expect_success(status)
}

async fn cmd_settings(
    config: &AppConfig,
    limits: Option<(u8, u8)>,
    adapter_sleep: Option<bool>,
) -> Result<()> {
    let mut client = daemon_client(config);
    let Some(current) = client.settings().await? else {
        bail!("power management is not supported on this host");
    };

    if limits.is_none() && adapter_sleep.is_none() {
        println!("min charge: {}%", current.min_charge);
        println!("max charge: {}%", current.max_charge);
        println!("adapter sleep: {}", on_off(current.adapter_sleep));
        return Ok(());
    }

    let (min_charge, max_charge) = limits.unwrap_or((current.min_charge, current.max_charge));
    let wanted = Settings {
        min_charge,
        max_charge,
        adapter_sleep: adapter_sleep.unwrap_or(current.adapter_sleep),
    };
    wanted.validate()?;

    let token = AuthorizationClient::new(&config.daemon.service_socket, call_timeout(config))
        .request_token(&[powergate_core::Right::ManagePower])
        .await
        .context("authorization failed")?;
    expect_success(client.set_settings(Some(&token), wanted).await)
}

// ── Config ──────────────────────────────────────────────────────────────

fn cmd_config(config: &AppConfig, path: &Path, show: bool) -> Result<()> {
    if show {
        let toml_str =
            toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("TOML error: {e}"))?;
        println!("{toml_str}");
    } else {
        println!("Configuration at '{}' is valid.", path.display());
    }
    Ok(())
}

/// Load the config file, or defaults when it does not exist.
async fn load_config(path: &Path) -> Result<(AppConfig, bool)> {
    if path.exists() {
        let config = AppConfig::load(path)
            .await
            .with_context(|| format!("invalid config at {}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((AppConfig::default(), false))
    }
}
