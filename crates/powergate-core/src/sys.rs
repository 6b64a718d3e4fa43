//! Process and user database lookups through libc.
//!
//! The only module allowed to call into libc directly.

#![allow(unsafe_code)]

use std::ffi::CStr;
use std::path::PathBuf;

/// Whether [`executable_of`] can resolve a pid on this platform.
pub const CAN_RESOLVE_EXECUTABLES: bool = cfg!(any(target_os = "linux", target_os = "macos"));

/// Upper bound for the `getpwuid_r` scratch buffer.
const MAX_PASSWD_BUFFER: usize = 1 << 20;

/// Outcome of resolving a process's executable path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutableLookup {
    Found(PathBuf),
    /// The process is gone or its path could not be read.
    Missing,
    /// This platform has no way to resolve executables.
    Unsupported,
}

pub fn current_uid() -> u32 {
    // SAFETY: getuid has no preconditions and cannot fail.
    unsafe { libc::getuid() }
}

/// Login name of `uid` from the system user database, directory services
/// included.
pub fn username(uid: u32) -> Option<String> {
    let mut buf: Vec<libc::c_char> = vec![0; 1024];
    loop {
        let mut entry = std::mem::MaybeUninit::<libc::passwd>::uninit();
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        // SAFETY: every pointer refers to live storage of the advertised size.
        let rc = unsafe {
            libc::getpwuid_r(
                uid,
                entry.as_mut_ptr(),
                buf.as_mut_ptr(),
                buf.len(),
                &mut result,
            )
        };
        if rc == libc::ERANGE && buf.len() < MAX_PASSWD_BUFFER {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if rc != 0 || result.is_null() {
            return None;
        }
        // SAFETY: on success `result` points at `entry`, whose `pw_name` is a
        // NUL-terminated string inside `buf`.
        let name = unsafe { CStr::from_ptr((*result).pw_name) };
        return Some(name.to_string_lossy().into_owned());
    }
}

#[cfg(target_os = "linux")]
pub fn executable_of(pid: i32) -> ExecutableLookup {
    match std::fs::read_link(format!("/proc/{pid}/exe")) {
        Ok(path) => ExecutableLookup::Found(path),
        Err(_) => ExecutableLookup::Missing,
    }
}

#[cfg(target_os = "macos")]
pub fn executable_of(pid: i32) -> ExecutableLookup {
    use std::os::unix::ffi::OsStringExt;

    let mut buf = vec![0u8; libc::PROC_PIDPATHINFO_MAXSIZE as usize];
    // SAFETY: `buf` is writable for the length passed.
    let len = unsafe { libc::proc_pidpath(pid, buf.as_mut_ptr().cast(), buf.len() as u32) };
    if len <= 0 {
        return ExecutableLookup::Missing;
    }
    buf.truncate(len as usize);
    ExecutableLookup::Found(PathBuf::from(std::ffi::OsString::from_vec(buf)))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn executable_of(_pid: i32) -> ExecutableLookup {
    ExecutableLookup::Unsupported
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_has_a_name() {
        assert_eq!(username(0).as_deref(), Some("root"));
    }

    #[test]
    fn test_unknown_uid_has_no_name() {
        assert_eq!(username(u32::MAX - 7), None);
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    #[test]
    fn test_own_executable_resolves() {
        let pid = std::process::id() as i32;
        let ExecutableLookup::Found(path) = executable_of(pid) else {
            panic!("own executable not resolved");
        };
        let expected = std::env::current_exe().unwrap();
        assert_eq!(
            std::fs::canonicalize(path).unwrap(),
            std::fs::canonicalize(expected).unwrap()
        );
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    #[test]
    fn test_dead_pid_is_missing() {
        assert_eq!(executable_of(i32::MAX), ExecutableLookup::Missing);
    }
}
