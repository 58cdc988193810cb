/// Network isolation through namespaces
///
/// A fresh network namespace contains only a down loopback interface, so
/// the sandboxed process cannot reach anything. Unprivileged callers need
/// a user namespace to be allowed to create it.
use nix::sched::CloneFlags;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

/// Check if namespace isolation is supported on this system
pub fn is_supported() -> bool {
    std::path::Path::new("/proc/self/ns/net").exists()
}

/// Flags to unshare for network isolation
pub fn network_isolation_flags(running_as_root: bool) -> CloneFlags {
    if running_as_root {
        CloneFlags::CLONE_NEWNET
    } else {
        CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNET
    }
}

pub fn running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Unshare in the current (forked, single-threaded) process.
/// Only async-signal-safe work happens here.
pub fn unshare_for_child(flags: CloneFlags) -> std::io::Result<()> {
    nix::sched::unshare(flags).map_err(|e| std::io::Error::from_raw_os_error(e as i32))
}

/// Launch `program -c pass` inside fresh namespaces to see whether this
/// host lets us create them.
pub fn probe_network_isolation(program: &str) -> bool {
    if !is_supported() {
        return false;
    }

    let flags = network_isolation_flags(running_as_root());
    let mut command = Command::new(program);
    command
        .args(["-c", "pass"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    // SAFETY: the closure only performs the unshare syscall.
    unsafe {
        command.pre_exec(move || unshare_for_child(flags));
    }

    match command.status() {
        Ok(status) => status.success(),
        Err(e) => {
            log::debug!("network namespace probe failed: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_depend_on_privilege() {
        assert_eq!(network_isolation_flags(true), CloneFlags::CLONE_NEWNET);
        assert!(network_isolation_flags(false).contains(CloneFlags::CLONE_NEWUSER));
        assert!(network_isolation_flags(false).contains(CloneFlags::CLONE_NEWNET));
    }

    #[test]
    fn test_running_as_root_matches_effective_uid() {
        assert_eq!(running_as_root(), unsafe { libc::geteuid() } == 0);
    }

    #[test]
    fn test_probe_with_missing_program_is_false() {
        assert!(!probe_network_isolation("/nonexistent/testbox-python"));
    }
}
