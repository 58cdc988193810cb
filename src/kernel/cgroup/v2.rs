/// Cgroup v2 backend implementation
///
/// One leaf per sandbox under a service-owned root. Peak memory comes from
/// memory.peak (kernel 5.19+) with memory.current as a fallback.
use crate::config::types::{Result, SandboxError};
use crate::kernel::cgroup::backend::{CgroupBackend, CgroupEvidence};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Cgroup v2 backend
pub struct CgroupV2 {
    base_path: PathBuf,
}

impl CgroupV2 {
    /// Backend over an existing root; no filesystem changes are made
    pub fn new(base_path: &Path) -> Self {
        CgroupV2 {
            base_path: base_path.to_path_buf(),
        }
    }

    /// Create the root and delegate memory and pids controllers to its children
    pub fn prepare_root(base_path: &Path) -> Result<Self> {
        fs::create_dir_all(base_path)
            .map_err(|e| SandboxError::Cgroup(format!("Failed to create cgroup root: {}", e)))?;

        let controllers = fs::read_to_string(base_path.join("cgroup.controllers"))
            .map_err(|e| SandboxError::Cgroup(format!("Failed to read cgroup.controllers: {}", e)))?;
        for required in ["memory", "pids"] {
            if !controllers.split_whitespace().any(|c| c == required) {
                return Err(SandboxError::Cgroup(format!(
                    "controller '{}' is not delegated to {}",
                    required,
                    base_path.display()
                )));
            }
        }

        fs::write(base_path.join("cgroup.subtree_control"), "+memory +pids").map_err(|e| {
            SandboxError::Cgroup(format!("Failed to enable memory/pids controllers: {}", e))
        })?;

        Ok(Self::new(base_path))
    }

    fn instance_path(&self, instance_id: &str) -> PathBuf {
        self.base_path.join(instance_id)
    }

    fn write_control(&self, instance_id: &str, file: &str, value: &str) -> Result<()> {
        let path = self.instance_path(instance_id).join(file);
        fs::write(&path, value)
            .map_err(|e| SandboxError::Cgroup(format!("Failed to write {}: {}", file, e)))
    }

    fn read_u64(path: &Path) -> Option<u64> {
        fs::read_to_string(path).ok()?.trim().parse::<u64>().ok()
    }

    /// Read memory.peak with fallback to memory.current
    fn peak_memory(&self, instance_id: &str) -> Option<u64> {
        let path = self.instance_path(instance_id);
        Self::read_u64(&path.join("memory.peak"))
            .or_else(|| Self::read_u64(&path.join("memory.current")))
    }

    /// Returns (oom_count, oom_kill_count) from memory.events
    fn oom_events(&self, instance_id: &str) -> Result<(u64, u64)> {
        let events_path = self.instance_path(instance_id).join("memory.events");
        if !events_path.exists() {
            return Ok((0, 0));
        }

        let content = fs::read_to_string(&events_path)
            .map_err(|e| SandboxError::Cgroup(format!("Failed to read memory.events: {}", e)))?;
        Ok(parse_memory_events(&content))
    }

    fn cpu_usage(&self, instance_id: &str) -> Option<u64> {
        let content = fs::read_to_string(self.instance_path(instance_id).join("cpu.stat")).ok()?;
        content.lines().find_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("usage_usec"), Some(value)) => value.parse().ok(),
                _ => None,
            }
        })
    }
}

fn parse_memory_events(content: &str) -> (u64, u64) {
    let mut oom_count = 0;
    let mut oom_kill_count = 0;

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() == 2 {
            match parts[0] {
                "oom" => oom_count = parts[1].parse::<u64>().unwrap_or(0),
                "oom_kill" => oom_kill_count = parts[1].parse::<u64>().unwrap_or(0),
                _ => {}
            }
        }
    }

    (oom_count, oom_kill_count)
}

impl CgroupBackend for CgroupV2 {
    fn backend_name(&self) -> &str {
        "cgroup_v2"
    }

    fn create(&self, instance_id: &str) -> Result<()> {
        let path = self.instance_path(instance_id);
        fs::create_dir(&path).map_err(|e| match e.raw_os_error() {
            Some(errno) if SandboxError::is_exhaustion_errno(errno) => {
                SandboxError::ResourceExhausted(format!("Failed to create cgroup: {}", e))
            }
            _ => SandboxError::Cgroup(format!("Failed to create cgroup: {}", e)),
        })?;

        // Whole-group OOM kill so a sandbox never limps on half-dead
        if path.join("memory.oom.group").exists() {
            if let Err(e) = self.write_control(instance_id, "memory.oom.group", "1") {
                log::debug!("memory.oom.group not applied: {}", e);
            }
        }
        Ok(())
    }

    fn remove(&self, instance_id: &str) -> Result<()> {
        let path = self.instance_path(instance_id);

        // rmdir fails with EBUSY until the last member has been reaped
        let mut last_error = None;
        for _ in 0..20 {
            match fs::remove_dir(&path) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => last_error = Some(e),
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        Err(SandboxError::Cgroup(format!(
            "Failed to remove cgroup {}: {}",
            path.display(),
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    fn attach_process(&self, instance_id: &str, pid: u32) -> Result<()> {
        self.write_control(instance_id, "cgroup.procs", &pid.to_string())
    }

    fn set_memory_limit(&self, instance_id: &str, limit_bytes: u64) -> Result<()> {
        self.write_control(instance_id, "memory.max", &limit_bytes.to_string())?;
        if self.instance_path(instance_id).join("memory.swap.max").exists() {
            self.write_control(instance_id, "memory.swap.max", "0")?;
        }
        Ok(())
    }

    fn set_process_limit(&self, instance_id: &str, limit: u32) -> Result<()> {
        self.write_control(instance_id, "pids.max", &limit.to_string())
    }

    fn kill_all(&self, instance_id: &str) -> Result<bool> {
        let kill_path = self.instance_path(instance_id).join("cgroup.kill");
        if !kill_path.exists() {
            return Ok(false);
        }
        self.write_control(instance_id, "cgroup.kill", "1")?;
        Ok(true)
    }

    fn collect_evidence(&self, instance_id: &str) -> Result<CgroupEvidence> {
        let (oom_events, oom_kill_events) = self.oom_events(instance_id)?;

        Ok(CgroupEvidence {
            memory_peak: self.peak_memory(instance_id),
            oom_events,
            oom_kill_events,
            cpu_usage_usec: self.cpu_usage(instance_id),
        })
    }

    fn get_cgroup_path(&self, instance_id: &str) -> PathBuf {
        self.instance_path(instance_id)
    }
}
