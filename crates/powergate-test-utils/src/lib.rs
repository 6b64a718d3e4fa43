#![deny(unsafe_code)]

//! Shared test utilities for the PowerGate workspace.
//!
//! Provides a simulated hardware controller, fakes for every registrar
//! collaborator, config builders, a socket-serving daemon fixture, and
//! tracing helpers so that individual crate tests stay concise.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! powergate-test-utils = { workspace = true }
//! ```

pub mod config;
pub mod daemon;
pub mod fakes;
pub mod smc;
pub mod tracing_setup;
