//! Peer identity checks for incoming socket connections.

use std::path::PathBuf;

use powergate_config::DaemonConfig;
use tokio::net::UnixStream;
use tracing::warn;

use crate::sys::{self, ExecutableLookup};

/// Credentials of the process on the other end of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub uid: u32,
    pub gid: u32,
    pub pid: Option<i32>,
}

impl PeerIdentity {
    pub fn of(stream: &UnixStream) -> std::io::Result<Self> {
        let cred = stream.peer_cred()?;
        Ok(Self {
            uid: cred.uid(),
            gid: cred.gid(),
            pid: cred.pid(),
        })
    }

    pub fn executable(&self) -> ExecutableLookup {
        match self.pid {
            Some(pid) => sys::executable_of(pid),
            None => ExecutableLookup::Missing,
        }
    }

    /// The peer's login name, or `uid:N` when the user database has none.
    pub fn username(&self) -> String {
        sys::username(self.uid).unwrap_or_else(|| format!("uid:{}", self.uid))
    }
}

/// Why a peer was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerRejection {
    #[error("uid {0} is not an allowed client")]
    Uid(u32),

    #[error("client executable could not be resolved")]
    UnknownExecutable,

    #[error("client executable {0} is not allowed")]
    Executable(PathBuf),

    #[error("client executables cannot be resolved on this platform")]
    ExecutableLookupUnsupported,
}

/// Which peers may talk to the daemon. Empty lists allow everyone.
#[derive(Debug, Clone, Default)]
pub struct ClientPolicy {
    allowed_uids: Vec<u32>,
    allowed_executables: Vec<PathBuf>,
}

impl ClientPolicy {
    pub fn new(allowed_uids: Vec<u32>, allowed_executables: Vec<PathBuf>) -> Self {
        Self {
            allowed_uids,
            allowed_executables,
        }
    }

    pub fn from_config(config: &DaemonConfig) -> Self {
        if !config.allowed_executables.is_empty() && !sys::CAN_RESOLVE_EXECUTABLES {
            warn!("executable allow list set but executables cannot be resolved here, refusing all clients");
        }
        Self::new(
            config.allowed_uids.clone(),
            config.allowed_executables.iter().map(PathBuf::from).collect(),
        )
    }

    pub fn check(&self, peer: &PeerIdentity) -> Result<(), PeerRejection> {
        self.check_lookup(peer, &peer.executable())
    }

    /// Check with an already-resolved executable.
    ///
    /// A non-empty executable list fails closed: a missing path and a
    /// platform without lookups are both refused.
    pub fn check_lookup(
        &self,
        peer: &PeerIdentity,
        executable: &ExecutableLookup,
    ) -> Result<(), PeerRejection> {
        if !self.allowed_uids.is_empty() && !self.allowed_uids.contains(&peer.uid) {
            return Err(PeerRejection::Uid(peer.uid));
        }
        if self.allowed_executables.is_empty() {
            return Ok(());
        }
        let exe = match executable {
            ExecutableLookup::Found(exe) => exe,
            ExecutableLookup::Missing => return Err(PeerRejection::UnknownExecutable),
            ExecutableLookup::Unsupported => {
                return Err(PeerRejection::ExecutableLookupUnsupported);
            }
        };
        if self.allowed_executables.contains(exe) {
            Ok(())
        } else {
            Err(PeerRejection::Executable(exe.clone()))
        }
    }
}
