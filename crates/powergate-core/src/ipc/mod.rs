//! Daemon IPC: HTTP/JSON over Unix domain sockets.
//!
//! Two endpoints, each a separate socket:
//!
//! ```text
//! ┌──────────┐   service.sock   ┌────────────────────────┐
//! │          │─────────────────▶│ authorization service  │
//! │  client  │   /authorize     │ (TokenBroker)          │
//! │  (CLI)   │                  └────────────────────────┘
//! │          │   daemon.sock    ┌────────────────────────┐
//! │          │─────────────────▶│ privileged daemon      │
//! └──────────┘   /execute ...   │ (Dispatcher)           │
//!                               └────────────────────────┘
//! ```
//!
//! Both servers check the peer's credentials against a [`peer::ClientPolicy`]
//! before serving a connection.

pub mod client;
pub mod peer;
pub mod server;
pub mod types;

pub use client::{AuthorizationClient, ClientError, DaemonClient};
pub use server::{AuthorityState, DaemonState, authority_router, daemon_router};
pub use types::*;
