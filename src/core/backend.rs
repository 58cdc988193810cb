//! Isolation backend contract.
//!
//! A backend turns a resource envelope into a [`SandboxHandle`], starts one
//! payload inside it and reports how that payload ended. Teardown lives on
//! the handle so it also runs when a handle is dropped on an error path.

use crate::config::config::{BackendKind, BackendSection};
use crate::config::types::{ResourceLimits, Result};
use crate::core::docker::DockerBackend;
use crate::core::handle::SandboxHandle;
use crate::core::process::ProcessBackend;
use crate::kernel::signal::KillReport;
use std::path::PathBuf;
use std::process::{ChildStderr, ChildStdout, ExitStatus};
use std::sync::Arc;

/// How the payload sees its own environment
#[derive(Clone, Debug, PartialEq)]
pub struct RuntimeView {
    /// Interpreter binary, resolved inside the sandbox
    pub interpreter: String,
    /// Working directory holding the written files
    pub workdir: PathBuf,
    /// Writable scratch directory, when filesystem access allows one
    pub scratch_dir: Option<PathBuf>,
    pub environment: Vec<(String, String)>,
}

impl RuntimeView {
    /// Baseline environment; nothing from the service's own environment leaks in
    pub fn base_environment(home: &std::path::Path, tmp: &std::path::Path) -> Vec<(String, String)> {
        vec![
            (
                "PATH".to_string(),
                "/usr/local/bin:/usr/bin:/bin".to_string(),
            ),
            ("HOME".to_string(), home.display().to_string()),
            ("TMPDIR".to_string(), tmp.display().to_string()),
            ("LANG".to_string(), "C.UTF-8".to_string()),
            ("PYTHONIOENCODING".to_string(), "utf-8".to_string()),
            ("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string()),
        ]
    }
}

/// Pipes of a launched payload
pub struct LaunchedPayload {
    pub pid: u32,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
}

/// Backend-normalized account of how a payload ended
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExitEvidence {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub oom_killed: bool,
    pub memory_peak: Option<u64>,
    pub cpu_time_ms: Option<u64>,
    /// The backend itself failed (e.g. the container runtime), not the payload
    pub infrastructure_error: Option<String>,
}

impl ExitEvidence {
    pub fn from_status(status: ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            exit_code: status.code(),
            signal: status.signal(),
            ..Self::default()
        }
    }
}

pub trait IsolationBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Reserve a slot and prepare an empty sandbox.
    /// Fails with `ResourceExhausted` when the host cannot provide one.
    fn acquire(&self, limits: &ResourceLimits) -> Result<SandboxHandle>;

    fn runtime_view(&self, handle: &SandboxHandle) -> RuntimeView;

    /// Seal the workspace and start `command` inside the sandbox
    fn launch(&self, handle: &mut SandboxHandle, command: &[String]) -> Result<LaunchedPayload>;

    /// Forcefully stop the payload and everything it spawned
    fn terminate(&self, handle: &mut SandboxHandle) -> KillReport;

    /// Interpret the payload's exit together with backend-side evidence
    fn exit_evidence(&self, handle: &SandboxHandle, status: ExitStatus) -> ExitEvidence;

    /// Tear the sandbox down. Always frees the slot, even when cleanup fails.
    fn release(&self, mut handle: SandboxHandle) -> Result<()> {
        handle.teardown()
    }

    fn active_sandboxes(&self) -> usize;

    fn capacity(&self) -> usize;
}

/// Build the configured backend
pub fn create_backend(
    config: &BackendSection,
    max_sandboxes: usize,
) -> Result<Arc<dyn IsolationBackend>> {
    match config.kind {
        BackendKind::Process => Ok(Arc::new(ProcessBackend::new(config, max_sandboxes)?)),
        BackendKind::Docker => Ok(Arc::new(DockerBackend::new(config, max_sandboxes)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    #[test]
    fn test_exit_evidence_from_status() {
        let exited = ExitEvidence::from_status(ExitStatus::from_raw(3 << 8));
        assert_eq!(exited.exit_code, Some(3));
        assert_eq!(exited.signal, None);

        let killed = ExitEvidence::from_status(ExitStatus::from_raw(libc::SIGKILL));
        assert_eq!(killed.exit_code, None);
        assert_eq!(killed.signal, Some(libc::SIGKILL));
    }

    #[test]
    fn test_base_environment_is_minimal() {
        let env = RuntimeView::base_environment(
            std::path::Path::new("/sandbox"),
            std::path::Path::new("/tmp"),
        );
        let keys: Vec<&str> = env.iter().map(|(k, _)| k.as_str()).collect();
        assert!(keys.contains(&"PATH"));
        assert!(keys.contains(&"TMPDIR"));
        assert!(!keys.contains(&"TESTBOX_AUTH_TOKEN"));
    }
}
