/// Host process isolation backend
///
/// The payload is a direct child of the service: its own session and process
/// group, rlimits, an optional network namespace and, when the hierarchy is
/// writable, a cgroup v2 leaf. It runs as the service user, so the read-only
/// workspace is enforced by permissions only.
use crate::config::config::BackendSection;
use crate::config::types::{FilesystemAccess, NetworkAccess, ResourceLimits, Result, SandboxError};
use crate::core::backend::{ExitEvidence, IsolationBackend, LaunchedPayload, RuntimeView};
use crate::core::handle::{SandboxHandle, SlotGuard};
use crate::exec::preexec::PreExecPlan;
use crate::kernel::cgroup::backend::create_cgroup_backend;
use crate::kernel::cgroup::CgroupBackend;
use crate::kernel::namespace;
use crate::kernel::signal::{self, KillReport, DEFAULT_KILL_GRACE};
use crate::observability::audit;
use crate::safety::workspace::WorkspaceManager;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct ProcessBackend {
    workspaces: WorkspaceManager,
    python_path: String,
    cgroups: Option<Arc<dyn CgroupBackend>>,
    network_isolation: bool,
    strict_mode: bool,
    capacity: usize,
    active: Arc<AtomicUsize>,
}

impl ProcessBackend {
    pub fn new(config: &BackendSection, capacity: usize) -> Result<Self> {
        let workspaces = WorkspaceManager::new(config.work_root.clone())?;
        match workspaces.cleanup_old_workspaces(Duration::from_secs(config.stale_workspace_secs)) {
            Ok(0) => {}
            Ok(n) => log::info!("Removed {} stale workspaces", n),
            Err(e) => log::warn!("Stale workspace sweep failed: {}", e),
        }

        let cgroups: Option<Arc<dyn CgroupBackend>> = if config.use_cgroups {
            create_cgroup_backend(&config.cgroup_root, config.strict_mode)?.map(Arc::from)
        } else {
            None
        };

        let network_isolation = namespace::probe_network_isolation(&config.python_path);
        if !network_isolation {
            if config.strict_mode {
                return Err(SandboxError::Config(
                    "network namespaces are unavailable and strict_mode is set".to_string(),
                ));
            }
            log::warn!(
                "Network namespaces unavailable; process sandboxes will not be network-isolated"
            );
        }

        Ok(Self {
            workspaces,
            python_path: config.python_path.clone(),
            cgroups,
            network_isolation,
            strict_mode: config.strict_mode,
            capacity,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn has_cgroups(&self) -> bool {
        self.cgroups.is_some()
    }

    pub fn has_network_isolation(&self) -> bool {
        self.network_isolation
    }

    /// Skip a control that could not be applied, unless strict mode forbids it
    fn degrade(&self, handle: &SandboxHandle, control: &str, err: SandboxError) -> Result<()> {
        if self.strict_mode {
            return Err(err);
        }
        log::warn!("Sandbox {}: {} not applied: {}", handle.id(), control, err);
        audit::events::control_degraded(handle.correlation(), control, &err.to_string());
        Ok(())
    }

    fn prepare_cgroup(&self, cgroups: &Arc<dyn CgroupBackend>, handle: &mut SandboxHandle) -> Result<()> {
        let id = handle.id().to_string();
        match cgroups.create(&id) {
            Ok(()) => {}
            Err(e @ SandboxError::ResourceExhausted(_)) => return Err(e),
            Err(e) => return self.degrade(handle, "cgroup", e),
        }
        handle.attach_cgroup(Arc::clone(cgroups));

        let limits = handle.limits().clone();
        let applied = cgroups
            .set_memory_limit(&id, limits.memory_limit_bytes)
            .and_then(|_| cgroups.set_process_limit(&id, limits.max_processes));
        match applied {
            Ok(()) => Ok(()),
            Err(e) => self.degrade(handle, "cgroup limits", e),
        }
    }
}

impl IsolationBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    fn acquire(&self, limits: &ResourceLimits) -> Result<SandboxHandle> {
        limits.validate()?;
        let slot = SlotGuard::try_acquire(&self.active, self.capacity)?;
        let mut workspace = self.workspaces.create_workspace()?;
        if limits.filesystem_access == FilesystemAccess::ReadOnly {
            workspace.create_scratch_dir()?;
        }

        let mut handle = SandboxHandle::new(self.name(), limits.clone(), workspace, slot);
        if let Some(cgroups) = &self.cgroups {
            if let Err(e) = self.prepare_cgroup(cgroups, &mut handle) {
                let _ = handle.teardown();
                return Err(e);
            }
        }

        if limits.network_access == NetworkAccess::Disabled && !self.network_isolation {
            audit::events::control_degraded(
                handle.correlation(),
                "network isolation",
                "network namespaces unavailable on this host",
            );
        }

        audit::events::sandbox_acquired(handle.correlation(), self.name());
        Ok(handle)
    }

    fn runtime_view(&self, handle: &SandboxHandle) -> RuntimeView {
        let workspace = handle.workspace();
        let workdir = workspace.run_dir().to_path_buf();
        let scratch_dir = workspace.scratch_dir().map(|p| p.to_path_buf());
        let home = scratch_dir.clone().unwrap_or_else(|| workdir.clone());

        RuntimeView {
            interpreter: self.python_path.clone(),
            environment: RuntimeView::base_environment(&home, &home),
            workdir,
            scratch_dir,
        }
    }

    fn launch(&self, handle: &mut SandboxHandle, command: &[String]) -> Result<LaunchedPayload> {
        let Some((program, args)) = command.split_first() else {
            return Err(SandboxError::Config("empty command".to_string()));
        };

        handle.workspace().seal()?;
        let view = self.runtime_view(handle);

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&view.workdir)
            .env_clear()
            .envs(view.environment.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        PreExecPlan::from_limits(handle.limits(), self.network_isolation, self.strict_mode)
            .install(&mut cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::from_io(&format!("Failed to spawn {}", program), e))?;

        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        handle.attach_child(child);

        if let Some(cgroup) = handle.cgroup().cloned() {
            if let Err(e) = cgroup.attach_process(handle.id(), pid) {
                if let Err(e) = self.degrade(handle, "cgroup attach", e) {
                    self.terminate(handle);
                    return Err(e);
                }
            }
        }

        audit::events::sandbox_launched(handle.correlation(), pid);
        Ok(LaunchedPayload {
            pid,
            stdout,
            stderr,
        })
    }

    fn terminate(&self, handle: &mut SandboxHandle) -> KillReport {
        let mut report = match handle.pgid() {
            Some(pgid) => signal::terminate_process_group(pgid, DEFAULT_KILL_GRACE),
            None => KillReport {
                already_exited: true,
                ..KillReport::default()
            },
        };

        if let Some(cgroup) = handle.cgroup() {
            match cgroup.kill_all(handle.id()) {
                Ok(true) => report.notes.push("cgroup.kill written".to_string()),
                Ok(false) => {}
                Err(e) => report.notes.push(format!("cgroup.kill failed: {}", e)),
            }
        }
        report
    }

    fn exit_evidence(&self, handle: &SandboxHandle, status: ExitStatus) -> ExitEvidence {
        let mut evidence = ExitEvidence::from_status(status);
        if let Some(cgroup) = handle.cgroup() {
            match cgroup.collect_evidence(handle.id()) {
                Ok(cg) => {
                    // An OOM event without a kill means the allocation failed
                    // and the payload carried on; only a kill ends the run.
                    evidence.oom_killed = cg.oom_kill_events > 0
                        || (cg.oom_events > 0 && evidence.signal == Some(libc::SIGKILL));
                    evidence.memory_peak = cg.memory_peak;
                    evidence.cpu_time_ms = cg.cpu_usage_usec.map(|us| us / 1000);
                }
                Err(e) => log::debug!("Sandbox {}: no cgroup evidence: {}", handle.id(), e),
            }
        }
        evidence
    }

    fn active_sandboxes(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}
