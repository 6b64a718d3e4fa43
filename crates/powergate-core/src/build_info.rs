//! Build metadata embedded by the build script.
//!
//! Reported by the daemon's health endpoint and by `powergate --version`, so
//! a client can tell which build of the daemon it is talking to.

use serde::{Deserialize, Serialize};

/// `git describe` of the source tree at build time.
pub const GIT_HASH: &str = env!("POWERGATE_GIT_HASH");

/// Build timestamp as a Unix epoch string.
pub const BUILD_TIMESTAMP: &str = env!("POWERGATE_BUILD_TIMESTAMP");

/// `debug` or `release`.
pub const BUILD_PROFILE: &str = env!("POWERGATE_BUILD_PROFILE");

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build metadata of one binary, as carried over IPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub version: String,
    pub git_hash: String,
    pub build_profile: String,
}

impl BuildInfo {
    /// Metadata of the running binary.
    pub fn current() -> Self {
        Self {
            version: VERSION.to_string(),
            git_hash: GIT_HASH.to_string(),
            build_profile: BUILD_PROFILE.to_string(),
        }
    }

    /// Whether both builds came from the same commit and profile.
    pub fn same_build(&self, other: &BuildInfo) -> bool {
        self == other
    }
}

/// e.g. `"0.1.0 (abc1234, debug)"`
pub fn version_string() -> String {
    format!("{VERSION} ({GIT_HASH}, {BUILD_PROFILE})")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_string_contains_version() {
        let v = version_string();
        assert!(v.contains(VERSION));
        assert!(v.contains(GIT_HASH));
    }

    #[test]
    fn test_current_build_matches_itself() {
        let info = BuildInfo::current();
        assert!(info.same_build(&BuildInfo::current()));
        assert_eq!(info.build_profile, "debug");
    }

    #[test]
    fn test_different_commit_is_different_build() {
        let mut other = BuildInfo::current();
        other.git_hash = "0000000".to_string();
        assert!(!BuildInfo::current().same_build(&other));
    }
}
