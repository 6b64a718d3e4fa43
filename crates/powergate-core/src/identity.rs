//! Daemon binary identity.
//!
//! Two daemon binaries are the same build exactly when their SHA-256 digests
//! match. The installed daemon reports the digest of its own executable; the
//! client hashes the daemon bundled next to it and compares.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use sha2::{Digest, Sha256};

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DaemonIdentity([u8; 32]);

impl DaemonIdentity {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    /// Hash the file at `path`.
    pub fn of_file(path: &Path) -> std::io::Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher)?;
        Ok(Self(hasher.finalize().into()))
    }

    /// Hash the running executable.
    pub fn current_exe() -> std::io::Result<Self> {
        Self::of_file(&std::env::current_exe()?)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for DaemonIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for DaemonIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DaemonIdentity({})", &self.to_hex()[..12])
    }
}

impl FromStr for DaemonIdentity {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut digest = [0u8; 32];
        hex::decode_to_slice(s, &mut digest)?;
        Ok(Self(digest))
    }
}
