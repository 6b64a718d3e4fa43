//! launchd-backed [`ServiceManager`] and [`HelperInstaller`].

use std::path::{Path, PathBuf};

use plist::{Dictionary, Value};
use powergate_config::{AppConfig, RegistrationConfig};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{HelperInstaller, RegistrarError, ServiceManager, ServiceStatus, io_err};
use crate::BoxFuture;
use crate::auth::{AuthorizationGate, CapabilityToken, Right};

const DOMAIN: &str = "system";
const APPROVAL_SETTINGS_URL: &str =
    "x-apple.systempreferences:com.apple.LoginItems-Settings.extension";

/// Render a launchd service descriptor running `program daemon`.
pub fn generate_descriptor(label: &str, program: &Path) -> Result<Vec<u8>, RegistrarError> {
    let mut dict = Dictionary::new();
    dict.insert("Label".to_string(), Value::String(label.to_string()));
    dict.insert(
        "ProgramArguments".to_string(),
        Value::Array(vec![
            Value::String(program.display().to_string()),
            Value::String("daemon".to_string()),
        ]),
    );
    dict.insert("RunAtLoad".to_string(), Value::Boolean(true));
    dict.insert("KeepAlive".to_string(), Value::Boolean(true));

    let mut out = Vec::new();
    Value::Dictionary(dict).to_writer_xml(&mut out)?;
    Ok(out)
}

fn descriptor_path(daemons_dir: &str, label: &str) -> PathBuf {
    Path::new(daemons_dir).join(format!("{label}.plist"))
}

fn service_target(label: &str) -> String {
    format!("{DOMAIN}/{label}")
}

#[cfg(target_os = "macos")]
fn ensure_macos() -> Result<(), RegistrarError> {
    Ok(())
}

#[cfg(not(target_os = "macos"))]
fn ensure_macos() -> Result<(), RegistrarError> {
    Err(RegistrarError::Unavailable)
}

async fn run_launchctl(args: &[&str], ignore_failure: bool) -> Result<(), RegistrarError> {
    debug!(?args, "launchctl");
    let output = Command::new("launchctl")
        .args(args)
        .output()
        .await
        .map_err(|e| io_err("launchctl", e))?;

    if output.status.success() || ignore_failure {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    Err(RegistrarError::Launchctl(format!(
        "{} (status {}): {stderr}",
        args.join(" "),
        output.status
    )))
}

async fn write_descriptor(path: &Path, label: &str, program: &Path) -> Result<(), RegistrarError> {
    let xml = generate_descriptor(label, program)?;
    tokio::fs::write(path, xml).await.map_err(|e| io_err(path, e))
}

async fn remove_if_present(path: &Path) -> Result<(), RegistrarError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(path, e)),
    }
}

// ── Managed service ─────────────────────────────────────────────────────

/// Registers the daemon as a launchd system service.
///
/// A descriptor on disk that launchd has not loaded counts as awaiting
/// approval.
pub struct LaunchdServiceManager {
    label: String,
    descriptor: PathBuf,
    program: PathBuf,
    legacy_descriptor: PathBuf,
    legacy_binary: PathBuf,
}

impl LaunchdServiceManager {
    pub fn from_config(config: &AppConfig) -> Self {
        let reg = &config.registration;
        Self {
            label: reg.daemon_label.clone(),
            descriptor: descriptor_path(&reg.daemons_dir, &reg.daemon_label),
            program: PathBuf::from(&reg.bundled_daemon),
            legacy_descriptor: descriptor_path(&reg.daemons_dir, &reg.legacy_label),
            legacy_binary: Path::new(&reg.helper_tools_dir).join(&reg.legacy_label),
        }
    }

    async fn status_inner(&self) -> ServiceStatus {
        if !self.descriptor.exists() {
            return ServiceStatus::NotRegistered;
        }
        if ensure_macos().is_err() {
            return ServiceStatus::NotFound;
        }
        match run_launchctl(&["print", &service_target(&self.label)], false).await {
            Ok(()) => ServiceStatus::Enabled,
            Err(e) => {
                debug!(error = %e, "service descriptor present but not loaded");
                ServiceStatus::RequiresApproval
            }
        }
    }

    async fn register_inner(&self) -> Result<(), RegistrarError> {
        ensure_macos()?;
        write_descriptor(&self.descriptor, &self.label, &self.program).await?;
        let descriptor = self.descriptor.display().to_string();
        run_launchctl(&["bootstrap", DOMAIN, &descriptor], false).await?;
        info!(label = %self.label, "service bootstrapped");
        Ok(())
    }

    async fn unregister_inner(&self) -> Result<(), RegistrarError> {
        ensure_macos()?;
        run_launchctl(&["bootout", &service_target(&self.label)], true).await?;
        remove_if_present(&self.descriptor).await?;
        info!(label = %self.label, "service booted out");
        Ok(())
    }
}

impl ServiceManager for LaunchdServiceManager {
    fn status(&mut self) -> BoxFuture<'_, ServiceStatus> {
        Box::pin(self.status_inner())
    }

    fn register(&mut self) -> BoxFuture<'_, Result<(), RegistrarError>> {
        Box::pin(self.register_inner())
    }

    fn unregister(&mut self) -> BoxFuture<'_, Result<(), RegistrarError>> {
        Box::pin(self.unregister_inner())
    }

    fn legacy_status(&mut self) -> BoxFuture<'_, ServiceStatus> {
        let installed = self.legacy_descriptor.exists() || self.legacy_binary.exists();
        Box::pin(async move {
            if installed {
                ServiceStatus::Enabled
            } else {
                ServiceStatus::NotFound
            }
        })
    }

    fn open_approval_settings(&mut self) {
        if let Err(e) = std::process::Command::new("open")
            .arg(APPROVAL_SETTINGS_URL)
            .spawn()
        {
            warn!(error = %e, "could not open approval settings");
        }
    }
}

// ── Legacy helper ───────────────────────────────────────────────────────

/// Copies the daemon into the privileged helper directory and bootstraps it.
///
/// Every install or removal spends a token that `gate` accepts for
/// [`Right::ModifySystemDaemons`]; nothing on disk or in launchd is touched
/// otherwise.
pub struct LaunchdHelperInstaller {
    label: String,
    source: PathBuf,
    binary: PathBuf,
    descriptor: PathBuf,
    gate: AuthorizationGate,
}

impl LaunchdHelperInstaller {
    pub fn from_config(config: &RegistrationConfig, gate: AuthorizationGate) -> Self {
        Self {
            label: config.legacy_label.clone(),
            source: PathBuf::from(&config.bundled_daemon),
            binary: Path::new(&config.helper_tools_dir).join(&config.legacy_label),
            descriptor: descriptor_path(&config.daemons_dir, &config.legacy_label),
            gate,
        }
    }

    fn verify(&self, token: &CapabilityToken) -> Result<(), RegistrarError> {
        let right = Right::ModifySystemDaemons;
        if self.gate.authorize(Some(&token.as_bytes()[..]), right) {
            Ok(())
        } else {
            warn!(label = %self.label, "helper change refused, token not authorized");
            Err(RegistrarError::Unauthorized(right))
        }
    }

    async fn install_inner(&self) -> Result<(), RegistrarError> {
        ensure_macos()?;
        run_launchctl(&["bootout", &service_target(&self.label)], true).await?;

        tokio::fs::copy(&self.source, &self.binary)
            .await
            .map_err(|e| io_err(&self.binary, e))?;
        set_helper_mode(&self.binary).await?;
        write_descriptor(&self.descriptor, &self.label, &self.binary).await?;

        let descriptor = self.descriptor.display().to_string();
        run_launchctl(&["bootstrap", DOMAIN, &descriptor], false).await
    }

    async fn remove_inner(&self) -> Result<(), RegistrarError> {
        ensure_macos()?;
        run_launchctl(&["bootout", &service_target(&self.label)], true).await?;
        remove_if_present(&self.descriptor).await?;
        remove_if_present(&self.binary).await
    }
}

async fn set_helper_mode(path: &Path) -> Result<(), RegistrarError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o544))
        .await
        .map_err(|e| io_err(path, e))
}

impl HelperInstaller for LaunchdHelperInstaller {
    fn install<'a>(
        &'a mut self,
        token: &'a CapabilityToken,
    ) -> BoxFuture<'a, Result<(), RegistrarError>> {
        debug!(label = %self.label, "installing legacy helper");
        Box::pin(async move {
            self.verify(token)?;
            self.install_inner().await
        })
    }

    fn remove<'a>(
        &'a mut self,
        token: &'a CapabilityToken,
    ) -> BoxFuture<'a, Result<(), RegistrarError>> {
        debug!(label = %self.label, "removing legacy helper");
        Box::pin(async move {
            self.verify(token)?;
            self.remove_inner().await
        })
    }

    fn is_installed(&self) -> bool {
        self.binary.exists() || self.descriptor.exists()
    }
}
