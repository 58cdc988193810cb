/// Sandbox handles
///
/// A handle owns every host resource behind one sandbox: the slot, the
/// workspace, the payload process, the cgroup leaf and the container.
/// Teardown is idempotent and runs from `Drop` as a safety net, so a handle
/// lost on an error path still frees its slot.
use crate::config::types::{ResourceLimits, Result, SandboxError};
use crate::core::docker::ContainerRef;
use crate::kernel::cgroup::CgroupBackend;
use crate::kernel::signal;
use crate::observability::audit::{self, CorrelationIds};
use crate::observability::metrics;
use crate::safety::workspace::Workspace;
use std::fmt;
use std::process::{Child, ExitStatus};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One reserved sandbox slot; released on drop
#[derive(Debug)]
pub struct SlotGuard {
    active: Arc<AtomicUsize>,
}

impl SlotGuard {
    pub fn try_acquire(active: &Arc<AtomicUsize>, capacity: usize) -> Result<Self> {
        active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < capacity).then_some(n + 1)
            })
            .map_err(|_| {
                SandboxError::ResourceExhausted(format!(
                    "all {} sandbox slots are in use",
                    capacity
                ))
            })?;

        Ok(Self {
            active: Arc::clone(active),
        })
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct SandboxHandle {
    id: String,
    backend: &'static str,
    limits: ResourceLimits,
    workspace: Workspace,
    correlation: CorrelationIds,
    child: Option<Child>,
    exit_status: Option<ExitStatus>,
    pgid: Option<i32>,
    cgroup: Option<Arc<dyn CgroupBackend>>,
    container: Option<ContainerRef>,
    slot: Option<SlotGuard>,
    executed: bool,
    released: bool,
}

impl SandboxHandle {
    pub(crate) fn new(
        backend: &'static str,
        limits: ResourceLimits,
        workspace: Workspace,
        slot: SlotGuard,
    ) -> Self {
        let id = workspace.run_id().to_string();
        Self {
            correlation: CorrelationIds::for_sandbox(&id),
            id,
            backend,
            limits,
            workspace,
            child: None,
            exit_status: None,
            pgid: None,
            cgroup: None,
            container: None,
            slot: Some(slot),
            executed: false,
            released: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn workspace_mut(&mut self) -> &mut Workspace {
        &mut self.workspace
    }

    pub fn correlation(&self) -> &CorrelationIds {
        &self.correlation
    }

    /// Tag audit events with the request and task this sandbox serves
    pub fn label(&mut self, request_id: &str, task_id: &str) {
        self.correlation = CorrelationIds::for_sandbox(&self.id)
            .with_request(request_id)
            .with_task(task_id);
    }

    /// Claim the handle's single execution
    pub fn begin_execution(&mut self) -> Result<()> {
        if self.released {
            return Err(SandboxError::Config(format!(
                "sandbox {} has been released",
                self.id
            )));
        }
        if self.executed {
            return Err(SandboxError::Config(format!(
                "sandbox {} has already executed a submission",
                self.id
            )));
        }
        self.executed = true;
        Ok(())
    }

    pub fn has_executed(&self) -> bool {
        self.executed
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub(crate) fn attach_cgroup(&mut self, cgroup: Arc<dyn CgroupBackend>) {
        self.cgroup = Some(cgroup);
    }

    pub(crate) fn cgroup(&self) -> Option<&Arc<dyn CgroupBackend>> {
        self.cgroup.as_ref()
    }

    pub(crate) fn attach_container(&mut self, container: ContainerRef) {
        self.container = Some(container);
    }

    pub(crate) fn container(&self) -> Option<&ContainerRef> {
        self.container.as_ref()
    }

    /// Track the launched process; it must lead its own process group
    pub(crate) fn attach_child(&mut self, child: Child) {
        self.pgid = Some(child.id() as i32);
        self.child = Some(child);
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    pub(crate) fn pgid(&self) -> Option<i32> {
        self.pgid
    }

    /// Non-blocking reap of the payload
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        if let Some(status) = self.exit_status {
            return Ok(Some(status));
        }
        let Some(child) = self.child.as_mut() else {
            return Err(SandboxError::Process(format!(
                "sandbox {} has no running payload",
                self.id
            )));
        };
        let status = child
            .try_wait()
            .map_err(|e| SandboxError::Process(format!("wait failed: {}", e)))?;
        self.exit_status = status;
        Ok(status)
    }

    pub fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }
        let Some(child) = self.child.as_mut() else {
            return Err(SandboxError::Process(format!(
                "sandbox {} has no running payload",
                self.id
            )));
        };
        let status = child
            .wait()
            .map_err(|e| SandboxError::Process(format!("wait failed: {}", e)))?;
        self.exit_status = Some(status);
        Ok(status)
    }

    /// SIGKILL whatever is left in the payload's process group
    pub fn sweep_process_group(&self) -> bool {
        self.pgid.is_some_and(signal::kill_process_group)
    }

    /// Kill, reap and remove everything this sandbox holds. Idempotent.
    /// The slot is freed even when some step fails.
    pub(crate) fn teardown(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let mut failures = Vec::new();

        self.sweep_process_group();
        if let Some(cgroup) = &self.cgroup {
            if let Err(e) = cgroup.kill_all(&self.id) {
                failures.push(format!("cgroup kill: {}", e));
            }
        }
        // A container only exists once `docker run` has been started
        if let (Some(container), Some(_)) = (&self.container, self.pgid) {
            if let Err(e) = container.remove() {
                failures.push(format!("container removal: {}", e));
            }
        }

        if let Some(mut child) = self.child.take() {
            if self.exit_status.is_none() {
                let _ = child.kill();
                match child.wait() {
                    Ok(status) => self.exit_status = Some(status),
                    Err(e) => failures.push(format!("reap: {}", e)),
                }
            }
        }

        if let Some(cgroup) = &self.cgroup {
            if let Err(e) = cgroup.remove(&self.id) {
                failures.push(format!("cgroup removal: {}", e));
            }
        }

        if let Err(e) = self.workspace.cleanup() {
            failures.push(format!("workspace removal: {}", e));
        }

        self.slot.take();

        if failures.is_empty() {
            audit::events::sandbox_released(&self.correlation);
            return Ok(());
        }

        let reason = failures.join("; ");
        log::error!("Sandbox {} teardown incomplete: {}", self.id, reason);
        metrics::get_metrics().teardown_failures.inc();
        audit::events::teardown_failure(&self.correlation, &reason);
        Err(SandboxError::Process(format!(
            "teardown of sandbox {} incomplete: {}",
            self.id, reason
        )))
    }
}

impl fmt::Debug for SandboxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxHandle")
            .field("id", &self.id)
            .field("backend", &self.backend)
            .field("pid", &self.pid())
            .field("executed", &self.executed)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        if !self.released {
            log::warn!("Sandbox {} dropped without release; tearing down", self.id);
            let _ = self.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::workspace::WorkspaceManager;
    use std::os::unix::process::CommandExt;
    use std::process::Command;

    fn handle(active: &Arc<AtomicUsize>, root: &std::path::Path) -> SandboxHandle {
        let manager = WorkspaceManager::new(root.to_path_buf()).unwrap();
        let workspace = manager.create_workspace().unwrap();
        let slot = SlotGuard::try_acquire(active, 2).unwrap();
        SandboxHandle::new("process", ResourceLimits::default(), workspace, slot)
    }

    #[test]
    fn test_slot_guard_caps_concurrency() {
        let active = Arc::new(AtomicUsize::new(0));
        let first = SlotGuard::try_acquire(&active, 1).unwrap();
        let err = SlotGuard::try_acquire(&active, 1).unwrap_err();
        assert!(matches!(err, SandboxError::ResourceExhausted(_)));

        drop(first);
        assert_eq!(active.load(Ordering::SeqCst), 0);
        assert!(SlotGuard::try_acquire(&active, 1).is_ok());
    }

    #[test]
    fn test_single_execution_per_handle() {
        let root = tempfile::tempdir().unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let mut handle = handle(&active, root.path());

        handle.begin_execution().unwrap();
        let err = handle.begin_execution().unwrap_err();
        assert!(matches!(err, SandboxError::Config(_)));
        handle.teardown().unwrap();
    }

    #[test]
    fn test_teardown_is_idempotent_and_frees_slot() {
        let root = tempfile::tempdir().unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let mut handle = handle(&active, root.path());
        let run_dir = handle.workspace().run_dir().to_path_buf();
        assert_eq!(active.load(Ordering::SeqCst), 1);

        handle.teardown().unwrap();
        handle.teardown().unwrap();
        assert!(handle.is_released());
        assert!(!run_dir.exists());
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_teardown_kills_running_payload() {
        let root = tempfile::tempdir().unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let mut handle = handle(&active, root.path());

        let child = Command::new("sleep").arg("30").process_group(0).spawn().unwrap();
        handle.attach_child(child);
        assert!(handle.try_wait().unwrap().is_none());

        let started = std::time::Instant::now();
        handle.teardown().unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_drop_releases_slot() {
        let root = tempfile::tempdir().unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        {
            let _handle = handle(&active, root.path());
            assert_eq!(active.load(Ordering::SeqCst), 1);
        }
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_executing_released_handle_fails() {
        let root = tempfile::tempdir().unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let mut handle = handle(&active, root.path());
        handle.teardown().unwrap();
        assert!(handle.begin_execution().is_err());
    }
}
