//! Charging and power adapter control on top of the register client.
//!
//! Charging is gated by the `CH0B`/`CH0C` pair and the power adapter by
//! `CH0I`. Support is detected once at startup by checking that each of
//! those registers exists with a single-byte `ui8 ` encoding.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use powergate_config::{ChargeSettingsConfig, MAX_CHARGE_LIMIT, MIN_CHARGE_LIMIT};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::dispatch::CommandHandlers;
use crate::smc::{FourCc, SmcClient, SmcError, SmcKey};

/// Register keys.
pub mod keys {
    use super::{FourCc, SmcKey};

    pub const CHARGING_B: SmcKey = FourCc::new(*b"CH0B");
    pub const CHARGING_C: SmcKey = FourCc::new(*b"CH0C");
    pub const ADAPTER: SmcKey = FourCc::new(*b"CH0I");

    pub const ALL: [SmcKey; 3] = [CHARGING_B, CHARGING_C, ADAPTER];
}

const CHARGING_ENABLED: u8 = 0x00;
const CHARGING_DISABLED: u8 = 0x02;
const ADAPTER_ENABLED: u8 = 0x00;
const ADAPTER_DISABLED: u8 = 0x01;

/// Errors from power handlers.
#[derive(Debug, thiserror::Error)]
pub enum PowerError {
    #[error(transparent)]
    Smc(#[from] SmcError),

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("failed to remove {path}: {source}")]
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Charge limits and adapter behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub min_charge: u8,
    pub max_charge: u8,
    pub adapter_sleep: bool,
}

impl Settings {
    pub fn validate(&self) -> Result<(), PowerError> {
        if self.min_charge < MIN_CHARGE_LIMIT || self.max_charge > MAX_CHARGE_LIMIT {
            return Err(PowerError::InvalidSettings(format!(
                "charge limits must lie within [{MIN_CHARGE_LIMIT}, {MAX_CHARGE_LIMIT}]"
            )));
        }
        if self.min_charge > self.max_charge {
            return Err(PowerError::InvalidSettings(format!(
                "min_charge {} exceeds max_charge {}",
                self.min_charge, self.max_charge
            )));
        }
        Ok(())
    }
}

impl From<&ChargeSettingsConfig> for Settings {
    fn from(config: &ChargeSettingsConfig) -> Self {
        Self {
            min_charge: config.min_charge,
            max_charge: config.max_charge,
            adapter_sleep: config.adapter_sleep,
        }
    }
}

/// Charging target requested by the last charge command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeMode {
    #[default]
    Standard,
    ToMaximum,
    ToFull,
}

/// Live power state reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerStateSnapshot {
    pub power_adapter_enabled: bool,
    pub charging_enabled: bool,
    pub charge_mode: ChargeMode,
    pub updating: bool,
}

struct ControllerState {
    mode: ChargeMode,
    settings: Settings,
}

/// Command handlers backed by the hardware controller.
pub struct PowerController {
    smc: Arc<SmcClient>,
    defaults: Settings,
    legacy_files: Vec<PathBuf>,
    state: Mutex<ControllerState>,
}

impl PowerController {
    pub fn new(smc: Arc<SmcClient>, defaults: Settings, legacy_files: Vec<PathBuf>) -> Self {
        Self {
            smc,
            defaults,
            legacy_files,
            state: Mutex::new(ControllerState {
                mode: ChargeMode::Standard,
                settings: defaults,
            }),
        }
    }

    /// Detect whether the host exposes every register this controller needs.
    pub fn probe(smc: &SmcClient) -> bool {
        if !smc.is_open() {
            return false;
        }
        for key in keys::ALL {
            match smc.get_key_info(key) {
                Ok(info) if info.is_u8() => {}
                Ok(info) => {
                    warn!(key = %key, data_type = %info.data_type, size = info.data_size, "unexpected register encoding");
                    return false;
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "register not available");
                    return false;
                }
            }
        }
        debug!("power registers detected");
        true
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_charging(&self, enabled: bool) -> Result<(), PowerError> {
        let value = if enabled {
            CHARGING_ENABLED
        } else {
            CHARGING_DISABLED
        };
        self.smc.write_u8(keys::CHARGING_B, value)?;
        self.smc.write_u8(keys::CHARGING_C, value)?;
        info!(enabled, "charging updated");
        Ok(())
    }

    fn set_adapter(&self, enabled: bool) -> Result<(), PowerError> {
        let value = if enabled {
            ADAPTER_ENABLED
        } else {
            ADAPTER_DISABLED
        };
        self.smc.write_u8(keys::ADAPTER, value)?;
        info!(enabled, "power adapter updated");
        Ok(())
    }
}

impl CommandHandlers for PowerController {
    fn remove_legacy_helper_files(&self) -> Result<(), PowerError> {
        for path in &self.legacy_files {
            match std::fs::remove_file(path) {
                Ok(()) => info!(path = %path.display(), "removed legacy helper file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(PowerError::Remove {
                        path: path.clone(),
                        source,
                    });
                }
            }
        }
        Ok(())
    }

    fn prepare_disable(&self) -> Result<(), PowerError> {
        if self.smc.is_open() {
            self.set_charging(true)?;
            self.set_adapter(true)?;
        }
        let mut state = self.lock();
        state.mode = ChargeMode::Standard;
        state.settings = self.defaults;
        info!("prepared for disable");
        Ok(())
    }

    fn disable_power_adapter(&self) -> Result<(), PowerError> {
        self.set_adapter(false)
    }

    fn enable_power_adapter(&self) -> Result<(), PowerError> {
        self.set_adapter(true)
    }

    fn charge_to_full(&self) -> Result<(), PowerError> {
        self.set_charging(true)?;
        self.lock().mode = ChargeMode::ToFull;
        Ok(())
    }

    fn charge_to_maximum(&self) -> Result<(), PowerError> {
        self.set_charging(true)?;
        self.lock().mode = ChargeMode::ToMaximum;
        Ok(())
    }

    fn disable_charging(&self) -> Result<(), PowerError> {
        self.set_charging(false)?;
        self.lock().mode = ChargeMode::Standard;
        Ok(())
    }

    fn state(&self, updating: bool) -> Result<PowerStateSnapshot, PowerError> {
        let charging = self.smc.read_u8(keys::CHARGING_B)?;
        let adapter = self.smc.read_u8(keys::ADAPTER)?;
        Ok(PowerStateSnapshot {
            power_adapter_enabled: adapter == ADAPTER_ENABLED,
            charging_enabled: charging == CHARGING_ENABLED,
            charge_mode: self.lock().mode,
            updating,
        })
    }

    fn settings(&self) -> Settings {
        self.lock().settings
    }

    fn set_settings(&self, settings: Settings) -> Result<(), PowerError> {
        settings.validate()?;
        self.lock().settings = settings;
        info!(
            min = settings.min_charge,
            max = settings.max_charge,
            adapter_sleep = settings.adapter_sleep,
            "settings updated"
        );
        Ok(())
    }
}
