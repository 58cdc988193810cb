//! Cgroup backend abstraction.
//!
//! Cgroups are an optional second layer on top of rlimits: they give a
//! whole-tree memory cap, OOM evidence and a reliable kill switch.

use crate::config::types::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Cgroup evidence from resource accounting
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct CgroupEvidence {
    pub memory_peak: Option<u64>,
    pub oom_events: u64,
    pub oom_kill_events: u64,
    pub cpu_usage_usec: Option<u64>,
}

impl CgroupEvidence {
    pub fn oom_observed(&self) -> bool {
        self.oom_events > 0 || self.oom_kill_events > 0
    }
}

pub trait CgroupBackend: Send + Sync {
    fn backend_name(&self) -> &str;
    fn create(&self, instance_id: &str) -> Result<()>;
    fn remove(&self, instance_id: &str) -> Result<()>;
    fn attach_process(&self, instance_id: &str, pid: u32) -> Result<()>;
    fn set_memory_limit(&self, instance_id: &str, limit_bytes: u64) -> Result<()>;
    fn set_process_limit(&self, instance_id: &str, limit: u32) -> Result<()>;
    /// Kill every process in the cgroup; false when the kernel lacks cgroup.kill
    fn kill_all(&self, instance_id: &str) -> Result<bool>;
    fn collect_evidence(&self, instance_id: &str) -> Result<CgroupEvidence>;
    fn get_cgroup_path(&self, instance_id: &str) -> PathBuf;
}

/// Detect a mounted cgroup v2 hierarchy
pub fn detect_cgroup_v2() -> bool {
    Path::new("/sys/fs/cgroup/cgroup.controllers").exists()
}

/// Create the cgroup backend rooted at `root`.
///
/// Returns `Ok(None)` when cgroups are unusable and strict mode is off;
/// the process backend then relies on rlimits alone.
pub fn create_cgroup_backend(
    root: &Path,
    strict_mode: bool,
) -> Result<Option<Box<dyn CgroupBackend>>> {
    let unavailable = |reason: String| -> Result<Option<Box<dyn CgroupBackend>>> {
        if strict_mode {
            Err(SandboxError::Cgroup(reason))
        } else {
            log::warn!("{}; continuing with rlimits only", reason);
            Ok(None)
        }
    };

    if !detect_cgroup_v2() {
        return unavailable("No cgroup v2 hierarchy mounted".to_string());
    }

    match crate::kernel::cgroup::v2::CgroupV2::prepare_root(root) {
        Ok(backend) => {
            log::info!("Using cgroup v2 backend at {}", root.display());
            Ok(Some(Box::new(backend)))
        }
        Err(e) => unavailable(format!("Cgroup root {} unusable: {}", root.display(), e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_cgroup_v2() {
        let _ = detect_cgroup_v2();
    }

    #[test]
    fn test_unusable_root_degrades_without_strict_mode() {
        let result = create_cgroup_backend(Path::new("/proc/testbox-no-cgroup"), false);
        assert!(matches!(result, Ok(None)));
    }

    #[test]
    fn test_unusable_root_fails_in_strict_mode() {
        let result = create_cgroup_backend(Path::new("/proc/testbox-no-cgroup"), true);
        assert!(result.is_err());
    }

    #[test]
    fn test_oom_observed() {
        let evidence = CgroupEvidence {
            oom_kill_events: 1,
            ..CgroupEvidence::default()
        };
        assert!(evidence.oom_observed());
        assert!(!CgroupEvidence::default().oom_observed());
    }
}
