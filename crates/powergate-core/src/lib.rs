#![deny(unsafe_code)]

//! PowerGate core: the privileged power daemon and its control plane.
//!
//! The daemon owns the hardware controller connection and executes power
//! commands for authorized clients. Clients obtain capability tokens from
//! the authorization service, talk to the daemon over a Unix socket, and
//! keep the installed daemon current through the [`registrar`].

use std::future::Future;
use std::pin::Pin;

/// A type-erased, `Send`-safe, boxed future: the return type for async
/// trait methods that require dynamic dispatch (`dyn Trait`).
///
/// Native `async fn` in traits produces opaque return types that are **not**
/// object-safe. Traits consumed via `Box<dyn Trait>` or `&dyn Trait` return
/// a concrete `Pin<Box<dyn Future>>` instead. This alias keeps those
/// signatures readable.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Capability tokens, rights, and the authorization gate.
pub mod auth;
/// Compile-time build metadata (version, git hash, profile).
pub mod build_info;
/// Privileged daemon runtime.
pub mod daemon;
/// Command codes, reply statuses, and the command dispatcher.
pub mod dispatch;
/// Daemon binary identity.
pub mod identity;
/// Unix socket IPC between clients and the daemon.
pub mod ipc;
/// Charging and power adapter control.
pub mod power;
/// Daemon installation, upgrade, approval, and removal.
pub mod registrar;
/// Hardware register client.
pub mod smc;
/// libc-backed process and user lookups.
pub mod sys;

pub use auth::{AuthorizationGate, CapabilityToken, Right, TokenBroker};
pub use daemon::Daemon;
pub use dispatch::{Command, Dispatcher, ReplyStatus};
pub use identity::DaemonIdentity;
pub use registrar::{Registrar, RegistrationState};
pub use smc::SmcClient;
