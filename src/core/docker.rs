/// Container isolation backend
///
/// Each sandbox is one `docker run` of the configured image. The workspace is
/// bind-mounted read-only at `/sandbox`; the container root filesystem is
/// read-only with a small tmpfs at `/tmp`. Containers are not started with
/// `--rm` so OOM state can be inspected after exit; teardown removes them.
use crate::config::config::BackendSection;
use crate::config::types::{FilesystemAccess, NetworkAccess, ResourceLimits, Result, SandboxError};
use crate::core::backend::{ExitEvidence, IsolationBackend, LaunchedPayload, RuntimeView};
use crate::core::handle::{SandboxHandle, SlotGuard};
use crate::exec::preexec::MAX_OPEN_FILES;
use crate::kernel::signal::{self, KillReport};
use crate::observability::audit;
use crate::safety::workspace::WorkspaceManager;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Mount point of the workspace inside the container
pub const CONTAINER_WORKDIR: &str = "/sandbox";
const CONTAINER_TMP: &str = "/tmp";
/// Unprivileged uid:gid the payload runs as
const CONTAINER_USER: &str = "65534:65534";
const TMPFS_SIZE: &str = "64m";
/// docker itself failed; the payload never ran
const DOCKER_ERROR_EXIT: i32 = 125;

/// A named container and the client used to manage it
#[derive(Clone, Debug, PartialEq)]
pub struct ContainerRef {
    pub docker_binary: String,
    pub name: String,
}

impl ContainerRef {
    fn docker(&self, args: &[&str]) -> std::io::Result<std::process::Output> {
        Command::new(&self.docker_binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
    }

    /// Remove the container, killing it if needed. Missing containers are fine.
    pub fn remove(&self) -> Result<()> {
        let output = self
            .docker(&["rm", "-f", &self.name])
            .map_err(|e| SandboxError::Process(format!("docker rm failed: {}", e)))?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such container") {
            return Ok(());
        }
        Err(SandboxError::Process(format!(
            "docker rm -f {} failed: {}",
            self.name,
            stderr.trim()
        )))
    }

    pub fn kill(&self) -> bool {
        matches!(self.docker(&["kill", &self.name]), Ok(out) if out.status.success())
    }

    /// OOMKilled flag from `docker inspect`; None when it cannot be read
    pub fn oom_killed(&self) -> Option<bool> {
        let output = self
            .docker(&["inspect", "--format", "{{.State.OOMKilled}}", &self.name])
            .ok()?;
        if !output.status.success() {
            return None;
        }
        match String::from_utf8_lossy(&output.stdout).trim() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }
}

pub struct DockerBackend {
    workspaces: WorkspaceManager,
    docker_binary: String,
    image: String,
    capacity: usize,
    active: Arc<AtomicUsize>,
}

impl DockerBackend {
    pub fn new(config: &BackendSection, capacity: usize) -> Result<Self> {
        let workspaces = WorkspaceManager::new(config.work_root.clone())?;
        match workspaces.cleanup_old_workspaces(Duration::from_secs(config.stale_workspace_secs)) {
            Ok(0) => {}
            Ok(n) => log::info!("Removed {} stale workspaces", n),
            Err(e) => log::warn!("Stale workspace sweep failed: {}", e),
        }

        Ok(Self {
            workspaces,
            docker_binary: config.docker_binary.clone(),
            image: config.docker_image.clone(),
            capacity,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn container_name(sandbox_id: &str) -> String {
        format!("testbox-{}", sandbox_id)
    }

    /// Arguments for `docker run`, up to and including the image
    pub fn run_arguments(
        &self,
        container_name: &str,
        run_dir: &Path,
        limits: &ResourceLimits,
        environment: &[(String, String)],
    ) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "--name".into(),
            container_name.into(),
            "--memory".into(),
            format!("{}b", limits.memory_limit_bytes),
            "--memory-swap".into(),
            format!("{}b", limits.memory_limit_bytes),
            "--pids-limit".into(),
            limits.max_processes.to_string(),
            "--ulimit".into(),
            format!(
                "cpu={}:{}",
                limits.cpu_time_limit_seconds,
                limits.cpu_time_limit_seconds + 1
            ),
            "--ulimit".into(),
            "core=0:0".into(),
            "--ulimit".into(),
            format!("nofile={}:{}", MAX_OPEN_FILES, MAX_OPEN_FILES),
            "--read-only".into(),
            "--cap-drop".into(),
            "ALL".into(),
            "--security-opt".into(),
            "no-new-privileges".into(),
            "--user".into(),
            CONTAINER_USER.into(),
        ];

        if limits.network_access == NetworkAccess::Disabled {
            args.extend(["--network".into(), "none".into()]);
        }

        match limits.filesystem_access {
            FilesystemAccess::ReadOnly => args.extend([
                "--tmpfs".into(),
                format!("{}:rw,nosuid,nodev,size={}", CONTAINER_TMP, TMPFS_SIZE),
            ]),
            FilesystemAccess::None => args.extend(["--ulimit".into(), "fsize=0:0".into()]),
        }

        args.extend([
            "-v".into(),
            format!("{}:{}:ro", run_dir.display(), CONTAINER_WORKDIR),
            "-w".into(),
            CONTAINER_WORKDIR.into(),
        ]);

        for (key, value) in environment {
            args.extend(["-e".into(), format!("{}={}", key, value)]);
        }

        args.push(self.image.clone());
        args
    }
}

impl IsolationBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn acquire(&self, limits: &ResourceLimits) -> Result<SandboxHandle> {
        limits.validate()?;
        let slot = SlotGuard::try_acquire(&self.active, self.capacity)?;
        let workspace = self.workspaces.create_workspace()?;

        let mut handle = SandboxHandle::new(self.name(), limits.clone(), workspace, slot);
        let name = Self::container_name(handle.id());
        handle.attach_container(ContainerRef {
            docker_binary: self.docker_binary.clone(),
            name,
        });

        audit::events::sandbox_acquired(handle.correlation(), self.name());
        Ok(handle)
    }

    fn runtime_view(&self, handle: &SandboxHandle) -> RuntimeView {
        let workdir = PathBuf::from(CONTAINER_WORKDIR);
        let scratch_dir = match handle.limits().filesystem_access {
            FilesystemAccess::ReadOnly => Some(PathBuf::from(CONTAINER_TMP)),
            FilesystemAccess::None => None,
        };
        let home = scratch_dir.clone().unwrap_or_else(|| workdir.clone());

        RuntimeView {
            interpreter: "python3".to_string(),
            environment: RuntimeView::base_environment(&home, &home),
            workdir,
            scratch_dir,
        }
    }

    fn launch(&self, handle: &mut SandboxHandle, command: &[String]) -> Result<LaunchedPayload> {
        if command.is_empty() {
            return Err(SandboxError::Config("empty command".to_string()));
        }
        let Some(container) = handle.container().cloned() else {
            return Err(SandboxError::Config(format!(
                "sandbox {} has no container",
                handle.id()
            )));
        };

        // The container user is not the service user, so the workspace
        // must be world-readable once sealed.
        handle.workspace().seal()?;

        let view = self.runtime_view(handle);
        let mut args = self.run_arguments(
            &container.name,
            handle.workspace().run_dir(),
            handle.limits(),
            &view.environment,
        );
        args.extend(command.iter().cloned());

        let mut child = Command::new(&self.docker_binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|e| {
                SandboxError::from_io(&format!("Failed to start {}", self.docker_binary), e)
            })?;

        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        handle.attach_child(child);
        audit::events::sandbox_launched(handle.correlation(), pid);

        Ok(LaunchedPayload {
            pid,
            stdout,
            stderr,
        })
    }

    fn terminate(&self, handle: &mut SandboxHandle) -> KillReport {
        let start = Instant::now();
        let mut report = KillReport::default();

        if let Some(container) = handle.container() {
            report.kill_sent = container.kill();
            if !report.kill_sent {
                report.notes.push("docker kill failed".to_string());
            }
        }
        // The client exits once the container is gone; the group kill covers
        // a client that hangs talking to the daemon.
        if let Some(pgid) = handle.pgid() {
            if signal::kill_process_group(pgid) {
                report.notes.push("docker client killed".to_string());
            }
        }

        report.waited_ms = start.elapsed().as_millis() as u64;
        report
    }

    fn exit_evidence(&self, handle: &SandboxHandle, status: ExitStatus) -> ExitEvidence {
        let mut evidence = ExitEvidence::from_status(status);
        let oom_killed = handle
            .container()
            .and_then(ContainerRef::oom_killed)
            .unwrap_or(false);

        match evidence.exit_code {
            Some(DOCKER_ERROR_EXIT) => {
                evidence.infrastructure_error = Some(format!(
                    "{} could not start the container (exit {})",
                    self.docker_binary, DOCKER_ERROR_EXIT
                ));
            }
            // The client reports a signalled payload as 128 + signal
            Some(code) if code > 128 && code < 128 + 65 => {
                evidence.exit_code = None;
                evidence.signal = Some(code - 128);
            }
            _ => {}
        }
        evidence.oom_killed = oom_killed;
        evidence
    }

    fn active_sandboxes(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}
