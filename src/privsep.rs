//! Process hardening
//!
//! Each child calls into here after receiving its configuration and
//! before touching untrusted input: verify the descriptor table holds
//! exactly what the master handed over, clamp resource limits, chroot
//! into an empty directory and drop to the configured uid/gid. Any
//! failure is fatal; a half-hardened process must not serve.

use std::io;

use nix::sys::resource::{setrlimit, Resource};
use nix::unistd::{setgroups, setresgid, setresuid, Gid, Uid};
use tracing_subscriber::EnvFilter;

use crate::error::Result;

/// Directory every child chroots into; must exist and be empty.
pub const EMPTY_DIR: &str = "/var/empty";

/// Data segment floor before the per-peer reservation.
const MIN_DATA: u64 = 1 << 21;

/// Per peer (or per listener) heap reservation.
const PER_UNIT_DATA: u64 = 1 << 12;

/// Descriptors the event loop machinery needs beyond the configured
/// channels (epoll, timer and signal plumbing).
const LOOP_FDS: u64 = 8;

/// Map the accumulated `-q`/`-v` count onto a log filter and install
/// the subscriber.
pub fn init_logging(role: &str, verbose: i32) {
    let level = match verbose {
        i32::MIN..=-2 => "error",
        -1 => "warn",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    // children double-initialize only in tests; ignore the error
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level))
        .with_target(false)
        .try_init();
    tracing::debug!(role, "logging initialized");
}

/// Number of open descriptors of this process.
pub fn open_fd_count() -> io::Result<usize> {
    let entries = std::fs::read_dir("/proc/self/fd")?.count();
    // the directory iterator itself holds one
    Ok(entries.saturating_sub(1))
}

/// A descriptor leak or a missing channel is a protocol violation.
pub fn expect_open_fds(expected: usize) -> Result<()> {
    let open = open_fd_count().map_err(crate::error::IpcError::from)?;
    if open != expected {
        return Err(crate::error::IpcError::StartupOrder {
            expected: "exact descriptor count",
        }
        .into());
    }
    Ok(())
}

/// Clamp the data segment by configured size, forbid cores and cap the
/// descriptor table at what is open now plus event loop overhead.
pub fn limit_resources(units: usize) -> Result<()> {
    let data = MIN_DATA + units as u64 * PER_UNIT_DATA + (1 << 24);
    setrlimit(Resource::RLIMIT_DATA, data, data).map_err(io_err)?;
    setrlimit(Resource::RLIMIT_CORE, 0, 0).map_err(io_err)?;

    let nofile = open_fd_count().map_err(crate::error::SepwireError::from)? as u64 + LOOP_FDS;
    setrlimit(Resource::RLIMIT_NOFILE, nofile, nofile).map_err(io_err)?;
    Ok(())
}

/// Confine the process to an empty, unwritable directory.
pub fn chroot_empty() -> Result<()> {
    nix::unistd::chroot(EMPTY_DIR).map_err(io_err)?;
    nix::unistd::chdir("/").map_err(io_err)?;
    Ok(())
}

/// Give up the superuser: supplementary groups, gid, then uid, all
/// three real/effective/saved.
pub fn drop_privileges(uid: u32, gid: u32) -> Result<()> {
    let uid = Uid::from_raw(uid);
    let gid = Gid::from_raw(gid);
    setgroups(&[gid]).map_err(io_err)?;
    setresgid(gid, gid, gid).map_err(io_err)?;
    setresuid(uid, uid, uid).map_err(io_err)?;
    Ok(())
}

fn io_err(errno: nix::errno::Errno) -> crate::error::SepwireError {
    crate::error::SepwireError::System(io::Error::from(errno))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fd_count_is_positive_and_stable() {
        let a = open_fd_count().unwrap();
        assert!(a >= 3, "stdio should be open, got {a}");
        let held = std::fs::File::open("/proc/self/status").unwrap();
        let b = open_fd_count().unwrap();
        assert_eq!(b, a + 1);
        drop(held);
        assert_eq!(open_fd_count().unwrap(), a);
    }
}
