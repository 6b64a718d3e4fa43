//! Command dispatcher.
//!
//! Maps a command code to its handler, consulting the
//! [`AuthorizationGate`] first. Evaluation order for one command:
//!
//! 1. `isSupported` is answered from startup detection, no token needed.
//! 2. Update markers flip the process-wide updating flag and succeed.
//! 3. Unknown codes are logged and fail.
//! 4. The token is reconstructed; absent means `NotAuthorized`.
//! 5. The command's right is checked; missing means `NotAuthorized`.
//! 6. Hardware commands on an unsupported host are `Unsupported`.
//! 7. The handler runs and its result is mapped to a [`ReplyStatus`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::auth::{AuthorizationGate, Right};
use crate::power::{PowerError, PowerStateSnapshot, Settings};
use crate::smc::SmcError;

/// Commands understood by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum Command {
    IsSupported = 0,
    PrepareUpdate = 1,
    FinishUpdate = 2,
    RemoveLegacyHelperFiles = 3,
    PrepareDisable = 4,
    DisablePowerAdapter = 5,
    EnablePowerAdapter = 6,
    ChargeToFull = 7,
    ChargeToMaximum = 8,
    DisableCharging = 9,
}

impl Command {
    pub const ALL: [Command; 10] = [
        Command::IsSupported,
        Command::PrepareUpdate,
        Command::FinishUpdate,
        Command::RemoveLegacyHelperFiles,
        Command::PrepareDisable,
        Command::DisablePowerAdapter,
        Command::EnablePowerAdapter,
        Command::ChargeToFull,
        Command::ChargeToMaximum,
        Command::DisableCharging,
    ];

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// The right a token must hold, or `None` for unauthenticated commands.
    pub fn required_right(self) -> Option<Right> {
        match self {
            Command::IsSupported | Command::PrepareUpdate | Command::FinishUpdate => None,
            Command::RemoveLegacyHelperFiles | Command::PrepareDisable => {
                Some(Right::ModifySystemDaemons)
            }
            Command::DisablePowerAdapter
            | Command::EnablePowerAdapter
            | Command::ChargeToFull
            | Command::ChargeToMaximum
            | Command::DisableCharging => Some(Right::ManagePower),
        }
    }

    pub fn requires_hardware(self) -> bool {
        self.required_right() == Some(Right::ManagePower)
    }

    pub fn name(self) -> &'static str {
        match self {
            Command::IsSupported => "is-supported",
            Command::PrepareUpdate => "prepare-update",
            Command::FinishUpdate => "finish-update",
            Command::RemoveLegacyHelperFiles => "remove-legacy-helper-files",
            Command::PrepareDisable => "prepare-disable",
            Command::DisablePowerAdapter => "disable-power-adapter",
            Command::EnablePowerAdapter => "enable-power-adapter",
            Command::ChargeToFull => "charge-to-full",
            Command::ChargeToMaximum => "charge-to-maximum",
            Command::DisableCharging => "disable-charging",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of one privileged request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReplyStatus {
    Success,
    Failure,
    Unsupported,
    NotAuthorized,
    CommunicationFailure,
    NativeFailure { kern_return: i32, smc_result: u8 },
}

impl ReplyStatus {
    pub fn is_success(self) -> bool {
        self == ReplyStatus::Success
    }
}

impl From<&PowerError> for ReplyStatus {
    fn from(err: &PowerError) -> Self {
        match err {
            PowerError::Smc(SmcError::Native {
                kern_return,
                smc_result,
            }) => ReplyStatus::NativeFailure {
                kern_return: *kern_return,
                smc_result: *smc_result,
            },
            PowerError::Smc(SmcError::Unsupported) => ReplyStatus::Unsupported,
            _ => ReplyStatus::Failure,
        }
    }
}

impl fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyStatus::Success => f.write_str("success"),
            ReplyStatus::Failure => f.write_str("failure"),
            ReplyStatus::Unsupported => f.write_str("unsupported"),
            ReplyStatus::NotAuthorized => f.write_str("not authorized"),
            ReplyStatus::CommunicationFailure => f.write_str("communication failure"),
            ReplyStatus::NativeFailure {
                kern_return,
                smc_result,
            } => write!(
                f,
                "native failure (kern_return {kern_return:#x}, smc result {smc_result:#04x})"
            ),
        }
    }
}

/// Handlers bound to authorized commands. Calls may block on hardware.
pub trait CommandHandlers: Send + Sync {
    fn remove_legacy_helper_files(&self) -> Result<(), PowerError>;
    fn prepare_disable(&self) -> Result<(), PowerError>;
    fn disable_power_adapter(&self) -> Result<(), PowerError>;
    fn enable_power_adapter(&self) -> Result<(), PowerError>;
    fn charge_to_full(&self) -> Result<(), PowerError>;
    fn charge_to_maximum(&self) -> Result<(), PowerError>;
    fn disable_charging(&self) -> Result<(), PowerError>;
    fn state(&self, updating: bool) -> Result<PowerStateSnapshot, PowerError>;
    fn settings(&self) -> Settings;
    fn set_settings(&self, settings: Settings) -> Result<(), PowerError>;
}

/// One dispatcher is shared by every daemon connection.
pub struct Dispatcher {
    gate: AuthorizationGate,
    handlers: Arc<dyn CommandHandlers>,
    supported: bool,
    updating: AtomicBool,
}

impl Dispatcher {
    pub fn new(gate: AuthorizationGate, handlers: Arc<dyn CommandHandlers>, supported: bool) -> Self {
        Self {
            gate,
            handlers,
            supported,
            updating: AtomicBool::new(false),
        }
    }

    pub fn supported(&self) -> bool {
        self.supported
    }

    pub fn updating(&self) -> bool {
        self.updating.load(Ordering::SeqCst)
    }

    /// Execute one command code with an optional wire token.
    pub fn dispatch(&self, token: Option<&[u8]>, code: u8) -> ReplyStatus {
        let Some(command) = Command::from_code(code) else {
            warn!(code, "unknown command");
            return ReplyStatus::Failure;
        };

        match command {
            Command::IsSupported => {
                return if self.supported {
                    ReplyStatus::Success
                } else {
                    ReplyStatus::Unsupported
                };
            }
            Command::PrepareUpdate => {
                info!("preparing update");
                self.updating.store(true, Ordering::SeqCst);
                return ReplyStatus::Success;
            }
            Command::FinishUpdate => {
                info!("update finished");
                self.updating.store(false, Ordering::SeqCst);
                return ReplyStatus::Success;
            }
            _ => {}
        }

        if let Some(status) = self.authorize(token, command.required_right(), command.requires_hardware()) {
            return status;
        }

        let result = match command {
            Command::RemoveLegacyHelperFiles => self.handlers.remove_legacy_helper_files(),
            Command::PrepareDisable => self.handlers.prepare_disable(),
            Command::DisablePowerAdapter => self.handlers.disable_power_adapter(),
            Command::EnablePowerAdapter => self.handlers.enable_power_adapter(),
            Command::ChargeToFull => self.handlers.charge_to_full(),
            Command::ChargeToMaximum => self.handlers.charge_to_maximum(),
            Command::DisableCharging => self.handlers.disable_charging(),
            Command::IsSupported | Command::PrepareUpdate | Command::FinishUpdate => Ok(()),
        };

        match result {
            Ok(()) => {
                info!(command = %command, "command executed");
                ReplyStatus::Success
            }
            Err(e) => {
                warn!(command = %command, error = %e, "command failed");
                ReplyStatus::from(&e)
            }
        }
    }

    /// Current power state. `None` when the host is unsupported.
    pub fn state(&self) -> Option<PowerStateSnapshot> {
        if !self.supported {
            return None;
        }
        match self.handlers.state(self.updating()) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(error = %e, "failed to read power state");
                None
            }
        }
    }

    /// Current settings. `None` when the host is unsupported.
    pub fn settings(&self) -> Option<Settings> {
        self.supported.then(|| self.handlers.settings())
    }

    pub fn set_settings(&self, token: Option<&[u8]>, settings: Settings) -> ReplyStatus {
        if let Some(status) = self.authorize(token, Some(Right::ManagePower), true) {
            return status;
        }
        match self.handlers.set_settings(settings) {
            Ok(()) => ReplyStatus::Success,
            Err(e) => {
                warn!(error = %e, "rejected settings");
                ReplyStatus::from(&e)
            }
        }
    }

    /// Right and support checks. `Some(status)` means the request stops here.
    fn authorize(
        &self,
        token: Option<&[u8]>,
        right: Option<Right>,
        requires_hardware: bool,
    ) -> Option<ReplyStatus> {
        if let Some(right) = right {
            if !self.gate.authorize(token, right) {
                warn!(right = %right, "token rejected for required right");
                return Some(ReplyStatus::NotAuthorized);
            }
        }
        if requires_hardware && !self.supported {
            return Some(ReplyStatus::Unsupported);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::auth::{AuthorizationHandle, CapabilityToken, PrivilegeBroker};
    use crate::power::ChargeMode;

    /// Tokens whose first byte is a bitmask: bit 0 = ModifySystemDaemons,
    /// bit 1 = ManagePower.
    struct MaskBroker;

    impl PrivilegeBroker for MaskBroker {
        fn from_external_form(&self, token: CapabilityToken) -> Option<AuthorizationHandle> {
            Some(AuthorizationHandle::new(token))
        }

        fn check_right(&self, handle: &AuthorizationHandle, right: Right) -> bool {
            let mask = handle.token().as_bytes()[0];
            match right {
                Right::ModifySystemDaemons => mask & 1 != 0,
                Right::ManagePower => mask & 2 != 0,
            }
        }

        fn consume(&self, _handle: AuthorizationHandle) {}
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<&'static str>>,
        fail_with: Option<SmcError>,
    }

    impl Recorder {
        fn record(&self, name: &'static str) -> Result<(), PowerError> {
            self.calls.lock().unwrap().push(name);
            match &self.fail_with {
                Some(e) => Err(PowerError::Smc(e.clone())),
                None => Ok(()),
            }
        }
    }

    impl CommandHandlers for Recorder {
        fn remove_legacy_helper_files(&self) -> Result<(), PowerError> {
            self.record("remove_legacy_helper_files")
        }
        fn prepare_disable(&self) -> Result<(), PowerError> {
            self.record("prepare_disable")
        }
        fn disable_power_adapter(&self) -> Result<(), PowerError> {
            self.record("disable_power_adapter")
        }
        fn enable_power_adapter(&self) -> Result<(), PowerError> {
            self.record("enable_power_adapter")
        }
        fn charge_to_full(&self) -> Result<(), PowerError> {
            self.record("charge_to_full")
        }
        fn charge_to_maximum(&self) -> Result<(), PowerError> {
            self.record("charge_to_maximum")
        }
        fn disable_charging(&self) -> Result<(), PowerError> {
            self.record("disable_charging")
        }
        fn state(&self, updating: bool) -> Result<PowerStateSnapshot, PowerError> {
            Ok(PowerStateSnapshot {
                power_adapter_enabled: true,
                charging_enabled: true,
                charge_mode: ChargeMode::Standard,
                updating,
            })
        }
        fn settings(&self) -> Settings {
            Settings {
                min_charge: 70,
                max_charge: 80,
                adapter_sleep: false,
            }
        }
        fn set_settings(&self, settings: Settings) -> Result<(), PowerError> {
            settings.validate()
        }
    }

    fn dispatcher(handlers: Arc<Recorder>, supported: bool) -> Dispatcher {
        Dispatcher::new(AuthorizationGate::new(Arc::new(MaskBroker)), handlers, supported)
    }

    fn token(mask: u8) -> [u8; 32] {
        let mut t = [0u8; 32];
        t[0] = mask;
        t
    }

    #[test]
    fn test_command_codes() {
        for (i, command) in Command::ALL.iter().enumerate() {
            assert_eq!(command.code() as usize, i);
            assert_eq!(Command::from_code(i as u8), Some(*command));
            assert_eq!(Command::from_name(command.name()), Some(*command));
        }
        assert_eq!(Command::from_code(10), None);
        assert_eq!(Command::ChargeToFull.required_right(), Some(Right::ManagePower));
        assert!(!Command::PrepareDisable.requires_hardware());
    }

    #[test]
    fn test_is_supported_needs_no_token() {
        let supported = dispatcher(Arc::default(), true);
        let unsupported = dispatcher(Arc::default(), false);
        assert_eq!(supported.dispatch(None, 0), ReplyStatus::Success);
        assert_eq!(unsupported.dispatch(None, 0), ReplyStatus::Unsupported);
    }

    #[test]
    fn test_update_markers() {
        let d = dispatcher(Arc::default(), false);
        assert_eq!(d.dispatch(None, Command::PrepareUpdate.code()), ReplyStatus::Success);
        assert!(d.updating());
        assert_eq!(d.dispatch(None, Command::FinishUpdate.code()), ReplyStatus::Success);
        assert!(!d.updating());
    }

    #[test]
    fn test_unknown_code_fails() {
        let d = dispatcher(Arc::default(), true);
        assert_eq!(d.dispatch(Some(&token(3)), 200), ReplyStatus::Failure);
    }

    #[test]
    fn test_missing_token_is_not_authorized() {
        let handlers = Arc::new(Recorder::default());
        let d = dispatcher(handlers.clone(), true);
        assert_eq!(d.dispatch(None, 7), ReplyStatus::NotAuthorized);
        assert_eq!(d.dispatch(Some(&[2u8; 5]), 7), ReplyStatus::NotAuthorized);
        assert!(handlers.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_wrong_right_is_not_authorized() {
        let handlers = Arc::new(Recorder::default());
        let d = dispatcher(handlers.clone(), true);

        assert_eq!(
            d.dispatch(Some(&token(1)), Command::ChargeToFull.code()),
            ReplyStatus::NotAuthorized
        );
        assert_eq!(
            d.dispatch(Some(&token(2)), Command::PrepareDisable.code()),
            ReplyStatus::NotAuthorized
        );
        assert!(handlers.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_authorized_commands_reach_handlers() {
        let handlers = Arc::new(Recorder::default());
        let d = dispatcher(handlers.clone(), true);

        assert!(d.dispatch(Some(&token(2)), Command::ChargeToFull.code()).is_success());
        assert!(d.dispatch(Some(&token(1)), Command::PrepareDisable.code()).is_success());
        assert_eq!(
            *handlers.calls.lock().unwrap(),
            vec!["charge_to_full", "prepare_disable"]
        );
    }

    #[test]
    fn test_hardware_command_on_unsupported_host() {
        let handlers = Arc::new(Recorder::default());
        let d = dispatcher(handlers.clone(), false);

        assert_eq!(
            d.dispatch(Some(&token(3)), Command::DisableCharging.code()),
            ReplyStatus::Unsupported
        );
        // Daemon-management commands do not need hardware.
        assert!(d.dispatch(Some(&token(3)), Command::RemoveLegacyHelperFiles.code()).is_success());
        assert_eq!(*handlers.calls.lock().unwrap(), vec!["remove_legacy_helper_files"]);
    }

    #[test]
    fn test_native_failure_is_preserved() {
        let handlers = Arc::new(Recorder {
            fail_with: Some(SmcError::Native {
                kern_return: 0,
                smc_result: 0x84,
            }),
            ..Recorder::default()
        });
        let d = dispatcher(handlers, true);

        assert_eq!(
            d.dispatch(Some(&token(2)), Command::DisablePowerAdapter.code()),
            ReplyStatus::NativeFailure {
                kern_return: 0,
                smc_result: 0x84
            }
        );
    }

    #[test]
    fn test_state_and_settings_when_unsupported() {
        let d = dispatcher(Arc::default(), false);
        assert!(d.state().is_none());
        assert!(d.settings().is_none());
        assert_eq!(
            d.set_settings(Some(&token(2)), d.handlers.settings()),
            ReplyStatus::Unsupported
        );
    }

    #[test]
    fn test_set_settings_requires_manage_power() {
        let d = dispatcher(Arc::default(), true);
        let settings = d.settings().unwrap();

        assert_eq!(d.set_settings(Some(&token(1)), settings), ReplyStatus::NotAuthorized);
        assert_eq!(d.set_settings(Some(&token(2)), settings), ReplyStatus::Success);

        let invalid = Settings {
            min_charge: 95,
            ..settings
        };
        assert_eq!(d.set_settings(Some(&token(2)), invalid), ReplyStatus::Failure);
    }

    #[test]
    fn test_state_reports_updating_flag() {
        let d = dispatcher(Arc::default(), true);
        d.dispatch(None, Command::PrepareUpdate.code());
        assert!(d.state().unwrap().updating);
    }

    #[test]
    fn test_reply_status_serde() {
        let json = serde_json::to_string(&ReplyStatus::NativeFailure {
            kern_return: -1,
            smc_result: 2,
        })
        .unwrap();
        assert!(json.contains("native_failure"));
        let back: ReplyStatus = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, ReplyStatus::NativeFailure { smc_result: 2, .. }));
    }
}
