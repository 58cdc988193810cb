/// Audit trail for sandbox lifecycle events
///
/// Every acquire, launch, kill, release and rejection is emitted as one JSON
/// object on the `testbox::audit` log target and, when configured, appended
/// to an audit file. Events carry the request, sandbox and task ids so a
/// single evaluation can be traced end to end.
use crate::config::types::{Result, SandboxError};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

/// Log target for audit events
pub const AUDIT_TARGET: &str = "testbox::audit";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    SandboxAcquired,
    SandboxLaunched,
    WallClockKill,
    CancelKill,
    SandboxReleased,
    TeardownFailure,
    ControlDegraded,
    AcquireRetry,
    RequestRejected,
}

impl AuditEventType {
    pub fn default_severity(&self) -> AuditSeverity {
        match self {
            AuditEventType::SandboxAcquired
            | AuditEventType::SandboxLaunched
            | AuditEventType::SandboxReleased => AuditSeverity::Low,
            AuditEventType::WallClockKill
            | AuditEventType::CancelKill
            | AuditEventType::AcquireRetry
            | AuditEventType::RequestRejected => AuditSeverity::Medium,
            AuditEventType::ControlDegraded => AuditSeverity::High,
            AuditEventType::TeardownFailure => AuditSeverity::Critical,
        }
    }
}

/// Identifiers tying an event to a request, a sandbox and a task
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CorrelationIds {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl CorrelationIds {
    pub fn for_sandbox(sandbox_id: &str) -> Self {
        Self {
            sandbox_id: Some(sandbox_id.to_string()),
            ..Self::default()
        }
    }

    pub fn with_request(mut self, request_id: &str) -> Self {
        self.request_id = Some(request_id.to_string());
        self
    }

    pub fn with_task(mut self, task_id: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub severity: AuditSeverity,
    pub timestamp: DateTime<Utc>,
    pub details: String,
    #[serde(flatten)]
    pub correlation: CorrelationIds,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, details: impl Into<String>) -> Self {
        Self {
            event_type,
            severity: event_type.default_severity(),
            timestamp: Utc::now(),
            details: details.into(),
            correlation: CorrelationIds::default(),
            pid: None,
        }
    }

    pub fn with_correlation(mut self, correlation: CorrelationIds) -> Self {
        self.correlation = correlation;
        self
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({"details": self.details}))
    }
}

/// File-backed audit sink
pub struct AuditLogger {
    audit_file: Mutex<File>,
    audit_path: PathBuf,
}

impl AuditLogger {
    pub fn new(audit_path: &Path) -> Result<Self> {
        if let Some(parent) = audit_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SandboxError::Config(format!("Failed to create audit log directory: {}", e))
            })?;
        }

        let audit_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(audit_path)
            .map_err(|e| SandboxError::Config(format!("Failed to open audit log: {}", e)))?;

        Ok(Self {
            audit_file: Mutex::new(audit_file),
            audit_path: audit_path.to_path_buf(),
        })
    }

    pub fn write(&self, entry: &serde_json::Value) {
        match self.audit_file.lock() {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{}", entry).and_then(|_| file.flush()) {
                    error!("Failed to write audit log {}: {}", self.audit_path.display(), e);
                }
            }
            Err(_) => error!("Audit log lock poisoned"),
        }
    }

    pub fn audit_path(&self) -> &Path {
        &self.audit_path
    }
}

static AUDIT_LOGGER: OnceLock<AuditLogger> = OnceLock::new();

/// Open the audit file. Without a path, events go to the log target only.
pub fn init_audit_log(audit_path: Option<&Path>) -> Result<()> {
    let Some(path) = audit_path else {
        return Ok(());
    };

    let logger = AuditLogger::new(path)?;
    if AUDIT_LOGGER.set(logger).is_err() {
        warn!("Audit log already initialized; keeping the first sink");
    } else {
        info!("Audit events appended to {}", path.display());
    }
    Ok(())
}

pub fn record(event: AuditEvent) {
    let entry = event.to_json();
    match event.severity {
        AuditSeverity::Critical | AuditSeverity::High => {
            error!(target: AUDIT_TARGET, "{}", entry)
        }
        AuditSeverity::Medium => warn!(target: AUDIT_TARGET, "{}", entry),
        AuditSeverity::Low => info!(target: AUDIT_TARGET, "{}", entry),
    }

    if let Some(logger) = AUDIT_LOGGER.get() {
        logger.write(&entry);
    }
}

/// Convenience constructors for lifecycle events
pub mod events {
    use super::*;

    pub fn sandbox_acquired(correlation: &CorrelationIds, backend: &str) {
        record(
            AuditEvent::new(
                AuditEventType::SandboxAcquired,
                format!("sandbox acquired on {} backend", backend),
            )
            .with_correlation(correlation.clone()),
        );
    }

    pub fn sandbox_launched(correlation: &CorrelationIds, pid: u32) {
        record(
            AuditEvent::new(AuditEventType::SandboxLaunched, "payload started")
                .with_correlation(correlation.clone())
                .with_pid(pid),
        );
    }

    pub fn wall_clock_kill(correlation: &CorrelationIds, timeout_ms: u64, escalated: bool) {
        record(
            AuditEvent::new(
                AuditEventType::WallClockKill,
                format!(
                    "wall-clock limit of {}ms reached; process group killed{}",
                    timeout_ms,
                    if escalated { " after SIGKILL escalation" } else { "" }
                ),
            )
            .with_correlation(correlation.clone()),
        );
    }

    pub fn cancel_kill(correlation: &CorrelationIds) {
        record(
            AuditEvent::new(AuditEventType::CancelKill, "evaluation cancelled; process group killed")
                .with_correlation(correlation.clone()),
        );
    }

    pub fn sandbox_released(correlation: &CorrelationIds) {
        record(
            AuditEvent::new(AuditEventType::SandboxReleased, "sandbox released")
                .with_correlation(correlation.clone()),
        );
    }

    pub fn teardown_failure(correlation: &CorrelationIds, reason: &str) {
        record(
            AuditEvent::new(
                AuditEventType::TeardownFailure,
                format!("sandbox teardown incomplete: {}", reason),
            )
            .with_correlation(correlation.clone()),
        );
    }

    pub fn control_degraded(correlation: &CorrelationIds, control: &str, reason: &str) {
        record(
            AuditEvent::new(
                AuditEventType::ControlDegraded,
                format!("{} not applied: {}", control, reason),
            )
            .with_correlation(correlation.clone()),
        );
    }

    pub fn acquire_retry(correlation: &CorrelationIds, attempt: u32, reason: &str) {
        record(
            AuditEvent::new(
                AuditEventType::AcquireRetry,
                format!("acquire attempt {} failed: {}", attempt, reason),
            )
            .with_correlation(correlation.clone()),
        );
    }

    pub fn request_rejected(correlation: &CorrelationIds, reason: &str) {
        record(
            AuditEvent::new(AuditEventType::RequestRejected, reason.to_string())
                .with_correlation(correlation.clone()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_flattens_correlation() {
        let correlation = CorrelationIds::for_sandbox("sb-1")
            .with_request("req-1")
            .with_task("task-1");
        let event = AuditEvent::new(AuditEventType::SandboxLaunched, "payload started")
            .with_correlation(correlation)
            .with_pid(42);

        let json = event.to_json();
        assert_eq!(json["event_type"], "sandbox_launched");
        assert_eq!(json["severity"], "low");
        assert_eq!(json["request_id"], "req-1");
        assert_eq!(json["sandbox_id"], "sb-1");
        assert_eq!(json["task_id"], "task-1");
        assert_eq!(json["pid"], 42);
    }

    #[test]
    fn test_missing_ids_are_omitted() {
        let json = AuditEvent::new(AuditEventType::RequestRejected, "queue full").to_json();
        assert!(json.get("request_id").is_none());
        assert!(json.get("pid").is_none());
    }

    #[test]
    fn test_teardown_failure_is_critical() {
        assert_eq!(
            AuditEventType::TeardownFailure.default_severity(),
            AuditSeverity::Critical
        );
        assert_eq!(
            AuditEventType::SandboxReleased.default_severity(),
            AuditSeverity::Low
        );
    }

    #[test]
    fn test_logger_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit").join("events.log");
        let logger = AuditLogger::new(&path).unwrap();

        logger.write(&AuditEvent::new(AuditEventType::SandboxAcquired, "a").to_json());
        logger.write(&AuditEvent::new(AuditEventType::SandboxReleased, "b").to_json());

        let content = std::fs::read_to_string(logger.audit_path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["event_type"], "sandbox_released");
    }
}
