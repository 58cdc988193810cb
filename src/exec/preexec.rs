/// Pre-exec setup for process-backend sandboxes
///
/// Runs in the forked child between fork and exec, so every step is a
/// raw syscall: no allocation, no locks, no logging. The sequence is fixed:
/// 1. setsid() so the payload leads its own session and process group
/// 2. prctl(PR_SET_PDEATHSIG, SIGKILL) so it dies with its launcher
/// 3. network namespace (user+net when unprivileged)
/// 4. rlimits: CPU, address space, processes, file size, core, open files
/// 5. umask 077
/// 6. prctl(PR_SET_NO_NEW_PRIVS, 1)
use crate::config::types::{FilesystemAccess, NetworkAccess, ResourceLimits};
use crate::kernel::namespace;
use nix::sched::CloneFlags;
use std::os::unix::process::CommandExt;
use std::process::Command;

/// Open file descriptor ceiling for sandboxed processes
pub const MAX_OPEN_FILES: u64 = 256;

/// Limits and isolation steps applied in the child before exec
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreExecPlan {
    pub cpu_time_secs: u64,
    pub memory_bytes: u64,
    pub max_processes: u64,
    /// `Some(0)` forbids creating or growing any file
    pub max_file_size: Option<u64>,
    pub max_open_files: u64,
    /// Namespaces to unshare for network isolation
    pub network_flags: Option<CloneFlags>,
    /// Fail the launch instead of skipping a step that cannot be applied
    pub strict_mode: bool,
}

impl PreExecPlan {
    pub fn from_limits(limits: &ResourceLimits, network_isolation: bool, strict_mode: bool) -> Self {
        let network_flags = match limits.network_access {
            NetworkAccess::Disabled if network_isolation || strict_mode => Some(
                namespace::network_isolation_flags(namespace::running_as_root()),
            ),
            _ => None,
        };

        Self {
            cpu_time_secs: limits.cpu_time_limit_seconds,
            memory_bytes: limits.memory_limit_bytes,
            max_processes: limits.max_processes as u64,
            max_file_size: match limits.filesystem_access {
                FilesystemAccess::None => Some(0),
                FilesystemAccess::ReadOnly => None,
            },
            max_open_files: MAX_OPEN_FILES,
            network_flags,
            strict_mode,
        }
    }

    /// Register the plan as the command's pre_exec hook
    pub fn install(self, command: &mut Command) {
        // SAFETY: apply() only issues async-signal-safe syscalls.
        unsafe {
            command.pre_exec(move || self.apply());
        }
    }

    /// Apply the plan to the current process. Child-side only.
    pub fn apply(&self) -> std::io::Result<()> {
        // SAFETY: plain syscalls without memory arguments.
        if unsafe { libc::setsid() } < 0 {
            return Err(std::io::Error::last_os_error());
        }

        // SAFETY: PR_SET_PDEATHSIG takes the signal number as its only argument.
        let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0) };
        self.check(rc)?;

        if let Some(flags) = self.network_flags {
            if let Err(e) = namespace::unshare_for_child(flags) {
                if self.strict_mode {
                    return Err(e);
                }
            }
        }

        // SIGXCPU at the soft limit, SIGKILL one second later
        apply_rlimit(
            libc::RLIMIT_CPU,
            self.cpu_time_secs,
            self.cpu_time_secs.saturating_add(1),
            self.strict_mode,
        )?;
        apply_rlimit(
            libc::RLIMIT_AS,
            self.memory_bytes,
            self.memory_bytes,
            self.strict_mode,
        )?;
        apply_rlimit(
            libc::RLIMIT_NPROC,
            self.max_processes,
            self.max_processes,
            self.strict_mode,
        )?;
        if let Some(size) = self.max_file_size {
            apply_rlimit(libc::RLIMIT_FSIZE, size, size, self.strict_mode)?;
        }
        apply_rlimit(libc::RLIMIT_CORE, 0, 0, self.strict_mode)?;
        apply_rlimit(
            libc::RLIMIT_NOFILE,
            self.max_open_files,
            self.max_open_files,
            self.strict_mode,
        )?;

        // SAFETY: umask cannot fail.
        unsafe {
            libc::umask(0o077);
        }

        // SAFETY: PR_SET_NO_NEW_PRIVS takes a flag as its only argument.
        let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
        self.check(rc)
    }

    fn check(&self, rc: libc::c_int) -> std::io::Result<()> {
        if rc != 0 && self.strict_mode {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }
}

fn apply_rlimit(
    resource: libc::__rlimit_resource_t,
    soft: u64,
    hard: u64,
    strict_mode: bool,
) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };

    // SAFETY: limit is a valid rlimit struct on the stack.
    let rc = unsafe { libc::setrlimit(resource, &limit) };
    if rc != 0 && strict_mode {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
