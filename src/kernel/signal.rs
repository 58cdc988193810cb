//! Process-group termination and signal naming.
//!
//! Every sandboxed process is a session/group leader, so one signal to the
//! group reaches everything it spawned.

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Grace period between SIGTERM and SIGKILL
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(200);

/// Signal escalation report for timeout/forced termination paths.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct KillReport {
    pub term_sent: bool,
    pub kill_sent: bool,
    /// The group was already gone when termination started
    pub already_exited: bool,
    pub waited_ms: u64,
    pub notes: Vec<String>,
}

fn signal_group(pgid: i32, signal: Signal) -> std::result::Result<(), Errno> {
    // pgid 0 and 1 would address our own group or init.
    if pgid <= 1 {
        return Err(Errno::EINVAL);
    }
    killpg(Pid::from_raw(pgid), signal)
}

/// SIGKILL the whole group. Returns false if nothing was left to kill.
pub fn kill_process_group(pgid: i32) -> bool {
    match signal_group(pgid, Signal::SIGKILL) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            log::warn!("SIGKILL to process group {} failed: {}", pgid, e);
            false
        }
    }
}

/// SIGTERM the group, wait `grace`, then SIGKILL whatever is left
pub fn terminate_process_group(pgid: i32, grace: Duration) -> KillReport {
    let mut report = KillReport::default();
    let start = Instant::now();

    match signal_group(pgid, Signal::SIGTERM) {
        Ok(()) => report.term_sent = true,
        Err(Errno::ESRCH) => {
            report.already_exited = true;
            report.waited_ms = start.elapsed().as_millis() as u64;
            return report;
        }
        Err(e) => report.notes.push(format!("group SIGTERM failed: {}", e)),
    }

    std::thread::sleep(grace);

    match signal_group(pgid, Signal::SIGKILL) {
        Ok(()) => report.kill_sent = true,
        Err(Errno::ESRCH) => report.notes.push("group exited during grace period".to_string()),
        Err(e) => report.notes.push(format!("group SIGKILL failed: {}", e)),
    }

    report.waited_ms = start.elapsed().as_millis() as u64;
    report
}

/// Human-readable name for a signal number, e.g. "SIGSEGV"
pub fn signal_name(signal: i32) -> String {
    match Signal::try_from(signal) {
        Ok(sig) => sig.as_str().to_string(),
        Err(_) => format!("signal {}", signal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;
    use std::process::Command;

    fn spawn_group_leader() -> std::process::Child {
        let mut command = Command::new("sleep");
        command.arg("30");
        command.process_group(0);
        command.spawn().unwrap()
    }

    #[test]
    fn test_signal_name() {
        assert_eq!(signal_name(libc::SIGKILL), "SIGKILL");
        assert_eq!(signal_name(libc::SIGXCPU), "SIGXCPU");
        assert_eq!(signal_name(4242), "signal 4242");
    }

    #[test]
    fn test_refuses_reserved_groups() {
        assert!(!kill_process_group(0));
        assert!(!kill_process_group(1));
        let report = terminate_process_group(1, Duration::from_millis(1));
        assert!(!report.term_sent);
        assert!(!report.kill_sent);
    }

    #[test]
    fn test_terminate_process_group() {
        let mut child = spawn_group_leader();
        let pgid = child.id() as i32;

        let report = terminate_process_group(pgid, Duration::from_millis(50));
        assert!(report.term_sent);

        let status = child.wait().unwrap();
        assert!(!status.success());
    }

    #[test]
    fn test_kill_after_exit_reports_nothing_left() {
        let mut child = spawn_group_leader();
        let pgid = child.id() as i32;
        assert!(kill_process_group(pgid));
        child.wait().unwrap();
        assert!(!kill_process_group(pgid));
    }
}
