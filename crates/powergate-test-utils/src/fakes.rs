//! Fakes for the registrar's OS collaborators and the privilege broker.
//!
//! Each fake is a cheap handle over shared state: clone it, box one clone
//! into the code under test, and inspect the other afterwards.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use powergate_core::BoxFuture;
use powergate_core::auth::{AuthorizationHandle, CapabilityToken, PrivilegeBroker, Right};
use powergate_core::dispatch::{Command, ReplyStatus};
use powergate_core::identity::DaemonIdentity;
use powergate_core::ipc::ClientError;
use powergate_core::registrar::{
    DaemonLink, HelperInstaller, RegistrarError, ServiceManager, ServiceStatus, TokenSource,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Service manager ─────────────────────────────────────────────────────

/// Observable state of a [`FakeServiceManager`].
#[derive(Debug, Clone)]
pub struct ManagerState {
    pub status: ServiceStatus,
    pub legacy: ServiceStatus,
    pub register_calls: usize,
    pub unregister_calls: usize,
    pub status_calls: usize,
    pub approval_prompts: usize,
    /// Status a successful register leaves behind.
    pub status_after_register: ServiceStatus,
    /// Register calls that fail before one succeeds.
    pub failing_registers: usize,
    /// Status polls after an approval prompt before the service turns on.
    pub approve_after_polls: Option<usize>,
    /// Unregister calls fail and leave the service in place.
    pub fail_unregister: bool,
    /// Register and unregister calls in the order they were made.
    pub calls: Vec<&'static str>,
    polls_since_prompt: usize,
}

impl ManagerState {
    /// Calls that change OS state.
    pub fn mutations(&self) -> usize {
        self.register_calls + self.unregister_calls
    }
}

#[derive(Clone)]
pub struct FakeServiceManager {
    state: Arc<Mutex<ManagerState>>,
    installer: Option<FakeInstaller>,
}

impl FakeServiceManager {
    pub fn new(status: ServiceStatus) -> Self {
        Self {
            state: Arc::new(Mutex::new(ManagerState {
                status,
                legacy: ServiceStatus::NotFound,
                register_calls: 0,
                unregister_calls: 0,
                status_calls: 0,
                approval_prompts: 0,
                status_after_register: ServiceStatus::Enabled,
                failing_registers: 0,
                approve_after_polls: None,
                fail_unregister: false,
                calls: Vec::new(),
                polls_since_prompt: 0,
            })),
            installer: None,
        }
    }

    /// Registration always lands in "requires approval" and the user never
    /// approves.
    pub fn never_enables(self) -> Self {
        lock(&self.state).status_after_register = ServiceStatus::RequiresApproval;
        self
    }

    /// The user approves after `polls` status checks following the prompt.
    pub fn approves_after(self, polls: usize) -> Self {
        lock(&self.state).approve_after_polls = Some(polls);
        self
    }

    /// The first `n` register calls fail.
    pub fn failing_registers(self, n: usize) -> Self {
        lock(&self.state).failing_registers = n;
        self
    }

    pub fn failing_unregister(self) -> Self {
        lock(&self.state).fail_unregister = true;
        self
    }

    /// Report legacy status from `installer` instead of a fixed value.
    pub fn with_legacy_installer(mut self, installer: FakeInstaller) -> Self {
        self.installer = Some(installer);
        self
    }

    pub fn snapshot(&self) -> ManagerState {
        lock(&self.state).clone()
    }
}

impl ServiceManager for FakeServiceManager {
    fn status(&mut self) -> BoxFuture<'_, ServiceStatus> {
        let mut state = lock(&self.state);
        state.status_calls += 1;
        if state.approval_prompts > 0 {
            state.polls_since_prompt += 1;
            if state
                .approve_after_polls
                .is_some_and(|n| state.polls_since_prompt > n)
            {
                state.status = ServiceStatus::Enabled;
            }
        }
        let status = state.status;
        Box::pin(async move { status })
    }

    fn register(&mut self) -> BoxFuture<'_, Result<(), RegistrarError>> {
        let mut state = lock(&self.state);
        state.register_calls += 1;
        state.calls.push("register");
        let result = if state.failing_registers > 0 {
            state.failing_registers -= 1;
            Err(RegistrarError::Launchctl("simulated bootstrap failure".to_string()))
        } else {
            state.status = state.status_after_register;
            Ok(())
        };
        Box::pin(async move { result })
    }

    fn unregister(&mut self) -> BoxFuture<'_, Result<(), RegistrarError>> {
        let mut state = lock(&self.state);
        state.unregister_calls += 1;
        state.calls.push("unregister");
        let result = if state.fail_unregister {
            Err(RegistrarError::Launchctl("simulated bootout failure".to_string()))
        } else {
            state.status = ServiceStatus::NotRegistered;
            Ok(())
        };
        Box::pin(async move { result })
    }

    fn legacy_status(&mut self) -> BoxFuture<'_, ServiceStatus> {
        let status = match &self.installer {
            Some(installer) if installer.is_installed() => ServiceStatus::Enabled,
            Some(_) => ServiceStatus::NotFound,
            None => lock(&self.state).legacy,
        };
        Box::pin(async move { status })
    }

    fn open_approval_settings(&mut self) {
        let mut state = lock(&self.state);
        state.approval_prompts += 1;
        state.polls_since_prompt = 0;
    }
}

// ── Helper installer ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct InstallerState {
    pub installed: bool,
    pub install_calls: usize,
    pub remove_calls: usize,
    pub fail: bool,
}

#[derive(Clone, Default)]
pub struct FakeInstaller {
    state: Arc<Mutex<InstallerState>>,
}

impl FakeInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn installed() -> Self {
        let installer = Self::default();
        lock(&installer.state).installed = true;
        installer
    }

    pub fn failing(self) -> Self {
        lock(&self.state).fail = true;
        self
    }

    pub fn snapshot(&self) -> InstallerState {
        lock(&self.state).clone()
    }
}

impl HelperInstaller for FakeInstaller {
    fn install<'a>(
        &'a mut self,
        _token: &'a CapabilityToken,
    ) -> BoxFuture<'a, Result<(), RegistrarError>> {
        let mut state = lock(&self.state);
        state.install_calls += 1;
        let result = if state.fail {
            Err(RegistrarError::Launchctl("simulated install failure".to_string()))
        } else {
            state.installed = true;
            Ok(())
        };
        Box::pin(async move { result })
    }

    fn remove<'a>(
        &'a mut self,
        _token: &'a CapabilityToken,
    ) -> BoxFuture<'a, Result<(), RegistrarError>> {
        let mut state = lock(&self.state);
        state.remove_calls += 1;
        let result = if state.fail {
            Err(RegistrarError::Launchctl("simulated removal failure".to_string()))
        } else {
            state.installed = false;
            Ok(())
        };
        Box::pin(async move { result })
    }

    fn is_installed(&self) -> bool {
        lock(&self.state).installed
    }
}

// ── Token source ────────────────────────────────────────────────────────

/// Hands out one fixed token, or refuses every request.
#[derive(Clone)]
pub struct StaticTokenSource {
    token: Option<CapabilityToken>,
    requests: Arc<AtomicUsize>,
}

impl StaticTokenSource {
    pub fn granting(token: CapabilityToken) -> Self {
        Self {
            token: Some(token),
            requests: Arc::default(),
        }
    }

    pub fn refusing() -> Self {
        Self {
            token: None,
            requests: Arc::default(),
        }
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl TokenSource for StaticTokenSource {
    fn request_token<'a>(
        &'a mut self,
        _rights: &'a [Right],
    ) -> BoxFuture<'a, Result<CapabilityToken, ClientError>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let result = self
            .token
            .clone()
            .ok_or_else(|| ClientError::Remote("authorization denied".to_string()));
        Box::pin(async move { result })
    }
}

// ── Daemon link ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LinkState {
    /// Identity the installed daemon reports. `None` = not reachable.
    pub identity: Option<DaemonIdentity>,
    pub reply: ReplyStatus,
    pub executed: Vec<Command>,
}

#[derive(Clone)]
pub struct FakeDaemonLink {
    state: Arc<Mutex<LinkState>>,
}

impl FakeDaemonLink {
    pub fn running(identity: DaemonIdentity) -> Self {
        Self::with(Some(identity))
    }

    pub fn unreachable() -> Self {
        Self::with(None)
    }

    fn with(identity: Option<DaemonIdentity>) -> Self {
        Self {
            state: Arc::new(Mutex::new(LinkState {
                identity,
                reply: ReplyStatus::Success,
                executed: Vec::new(),
            })),
        }
    }

    pub fn snapshot(&self) -> LinkState {
        lock(&self.state).clone()
    }
}

impl DaemonLink for FakeDaemonLink {
    fn unique_id(&mut self) -> BoxFuture<'_, Result<DaemonIdentity, ClientError>> {
        let result = lock(&self.state)
            .identity
            .ok_or_else(|| ClientError::NotRunning("/fake/daemon.sock".into()));
        Box::pin(async move { result })
    }

    fn execute<'a>(
        &'a mut self,
        command: Command,
        _token: Option<&'a CapabilityToken>,
    ) -> BoxFuture<'a, ReplyStatus> {
        let mut state = lock(&self.state);
        state.executed.push(command);
        let reply = if state.identity.is_some() {
            state.reply
        } else {
            ReplyStatus::CommunicationFailure
        };
        Box::pin(async move { reply })
    }
}

// ── Privilege broker ────────────────────────────────────────────────────

/// Accepts any well-formed token, grants a fixed right set, and counts
/// every call.
pub struct CountingBroker {
    granted: HashSet<Right>,
    reconstructions: AtomicUsize,
    right_checks: AtomicUsize,
    consumed: AtomicUsize,
}

impl CountingBroker {
    pub fn granting(rights: &[Right]) -> Arc<Self> {
        Arc::new(Self {
            granted: rights.iter().copied().collect(),
            reconstructions: AtomicUsize::new(0),
            right_checks: AtomicUsize::new(0),
            consumed: AtomicUsize::new(0),
        })
    }

    pub fn reconstructions(&self) -> usize {
        self.reconstructions.load(Ordering::SeqCst)
    }

    pub fn right_checks(&self) -> usize {
        self.right_checks.load(Ordering::SeqCst)
    }

    pub fn consumed(&self) -> usize {
        self.consumed.load(Ordering::SeqCst)
    }
}

impl PrivilegeBroker for CountingBroker {
    fn from_external_form(&self, token: CapabilityToken) -> Option<AuthorizationHandle> {
        self.reconstructions.fetch_add(1, Ordering::SeqCst);
        Some(AuthorizationHandle::new(token))
    }

    fn check_right(&self, _handle: &AuthorizationHandle, right: Right) -> bool {
        self.right_checks.fetch_add(1, Ordering::SeqCst);
        self.granted.contains(&right)
    }

    fn consume(&self, _handle: AuthorizationHandle) {
        self.consumed.fetch_add(1, Ordering::SeqCst);
    }
}
