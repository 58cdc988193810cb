/// Core types and structures for the testbox service
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Language used when a submission does not name one
pub const DEFAULT_LANGUAGE: &str = "python";

/// Network policy for a sandbox
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum NetworkAccess {
    #[serde(rename = "enabled")]
    Enabled,
    #[serde(rename = "disabled")]
    #[default]
    Disabled,
}

/// Filesystem policy for a sandbox
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum FilesystemAccess {
    /// Workspace is read-only, a private scratch directory is writable
    #[serde(rename = "read_only")]
    #[default]
    ReadOnly,
    /// No file may be created or grown
    #[serde(rename = "none")]
    None,
}

/// Per-sandbox resource envelope
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResourceLimits {
    /// CPU time limit (seconds)
    pub cpu_time_limit_seconds: u64,
    /// Address space / memory limit (bytes)
    pub memory_limit_bytes: u64,
    /// Wall clock ceiling enforced by the driver (seconds)
    pub wall_clock_timeout_seconds: u64,
    pub network_access: NetworkAccess,
    pub filesystem_access: FilesystemAccess,
    /// Maximum number of processes/threads inside the sandbox
    pub max_processes: u32,
    /// Cap on captured stdout (bytes)
    pub max_output_bytes: u64,
    /// Cap on captured stderr (bytes)
    pub max_stderr_bytes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_time_limit_seconds: 10,
            memory_limit_bytes: 512 * 1024 * 1024,
            wall_clock_timeout_seconds: 15,
            network_access: NetworkAccess::Disabled,
            filesystem_access: FilesystemAccess::ReadOnly,
            max_processes: 64,
            max_output_bytes: 1024 * 1024,
            max_stderr_bytes: 256 * 1024,
        }
    }
}

impl ResourceLimits {
    pub fn cpu_time_limit(&self) -> Duration {
        Duration::from_secs(self.cpu_time_limit_seconds)
    }

    pub fn wall_clock_timeout(&self) -> Duration {
        Duration::from_secs(self.wall_clock_timeout_seconds)
    }

    /// Reject envelopes that cannot produce a meaningful run
    pub fn validate(&self) -> Result<()> {
        if self.cpu_time_limit_seconds == 0 {
            return Err(SandboxError::Config(
                "cpu_time_limit_seconds must be positive".to_string(),
            ));
        }
        if self.wall_clock_timeout_seconds == 0 {
            return Err(SandboxError::Config(
                "wall_clock_timeout_seconds must be positive".to_string(),
            ));
        }
        if self.memory_limit_bytes < 16 * 1024 * 1024 {
            return Err(SandboxError::Config(format!(
                "memory_limit_bytes={} is below the 16 MiB floor",
                self.memory_limit_bytes
            )));
        }
        if self.max_processes == 0 {
            return Err(SandboxError::Config(
                "max_processes must be at least 1".to_string(),
            ));
        }
        if self.max_output_bytes == 0 {
            return Err(SandboxError::Config(
                "max_output_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Code submitted for evaluation
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Submission {
    pub task_id: String,
    pub code: String,
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_language() -> String {
    DEFAULT_LANGUAGE.to_string()
}

/// How a test case decides pass/fail
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Check {
    /// Code that raises AssertionError on failure
    Assertion { code: String },
    /// Code whose captured stdout must equal `expected` (trailing whitespace ignored)
    ExpectedOutput { code: String, expected: String },
}

impl Check {
    pub fn code(&self) -> &str {
        match self {
            Check::Assertion { code } => code,
            Check::ExpectedOutput { code, .. } => code,
        }
    }
}

/// A single unit/functional test run against a submission
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TestCase {
    pub id: String,
    /// Setup code executed in the test's namespace before the check
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixture: Option<String>,
    pub check: Check,
}

/// Run-level classification of one sandbox execution
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ExecutionStatus {
    /// Harness exited normally
    #[serde(rename = "OK")]
    #[default]
    Ok,
    /// Wall clock or CPU limit exceeded
    #[serde(rename = "TLE")]
    TimeLimit,
    /// Memory limit exceeded
    #[serde(rename = "MLE")]
    MemoryLimit,
    /// Non-zero exit
    #[serde(rename = "RE")]
    RuntimeError,
    /// Fatal signal not attributable to a limit
    #[serde(rename = "SIG")]
    Signaled,
    /// Infrastructure failure (launch, cancellation, collection)
    #[serde(rename = "IE")]
    InternalError,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ExecutionStatus::Ok => "OK",
            ExecutionStatus::TimeLimit => "TLE",
            ExecutionStatus::MemoryLimit => "MLE",
            ExecutionStatus::RuntimeError => "RE",
            ExecutionStatus::Signaled => "SIG",
            ExecutionStatus::InternalError => "IE",
        };
        write!(f, "{}", label)
    }
}

/// Output integrity classification
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum OutputIntegrity {
    #[serde(rename = "complete")]
    #[default]
    Complete,
    #[serde(rename = "truncated_by_limit")]
    TruncatedByLimit,
    #[serde(rename = "collection_timeout")]
    CollectionTimeout,
    #[serde(rename = "read_error")]
    ReadError,
}

impl std::fmt::Display for OutputIntegrity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputIntegrity::Complete => write!(f, "complete"),
            OutputIntegrity::TruncatedByLimit => write!(f, "truncated_by_limit"),
            OutputIntegrity::CollectionTimeout => write!(f, "collection_timeout"),
            OutputIntegrity::ReadError => write!(f, "read_error"),
        }
    }
}

/// Raw outcome of one sandbox run. Produced once per (submission, sandbox run).
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    /// Signal that terminated the process (if any)
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub output_integrity: OutputIntegrity,
    pub output_truncated: bool,
    /// Killed by the wall clock ceiling
    pub timed_out: bool,
    /// Terminated by the memory limit (cgroup or container OOM evidence)
    pub oom_killed: bool,
    pub wall_time_ms: u64,
    /// Peak memory (bytes) when the backend can observe it
    pub memory_peak: Option<u64>,
    /// Per-run prefix carried by every result record on stdout
    pub record_marker: String,
    pub error_message: Option<String>,
}

impl ExecutionResult {
    /// Result for a run that never produced usable evidence
    pub fn internal_error(record_marker: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::InternalError,
            record_marker: record_marker.into(),
            error_message: Some(message.into()),
            ..Self::default()
        }
    }

    /// CPU limit signalled through RLIMIT_CPU rather than the wall clock
    pub fn cpu_limit_exceeded(&self) -> bool {
        !self.timed_out
            && self.status == ExecutionStatus::TimeLimit
            && self.signal == Some(libc::SIGXCPU)
    }
}

/// ExecutionResult without the stdout/stderr bodies, returned to callers
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ExecutionSummary {
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub timed_out: bool,
    pub oom_killed: bool,
    pub output_truncated: bool,
    pub output_integrity: OutputIntegrity,
    pub wall_time_ms: u64,
    pub memory_peak: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl From<&ExecutionResult> for ExecutionSummary {
    fn from(result: &ExecutionResult) -> Self {
        Self {
            status: result.status,
            exit_code: result.exit_code,
            signal: result.signal,
            timed_out: result.timed_out,
            oom_killed: result.oom_killed,
            output_truncated: result.output_truncated,
            output_integrity: result.output_integrity,
            wall_time_ms: result.wall_time_ms,
            memory_peak: result.memory_peak,
            error_message: result.error_message.clone(),
        }
    }
}

/// Per-test outcome
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
    Error,
    Timeout,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Pass => write!(f, "pass"),
            Outcome::Fail => write!(f, "fail"),
            Outcome::Error => write!(f, "error"),
            Outcome::Timeout => write!(f, "timeout"),
        }
    }
}

/// Structured result for one test case
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Verdict {
    pub test_case_id: String,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Verdict {
    pub fn new(test_case_id: impl Into<String>, outcome: Outcome, message: Option<String>) -> Self {
        Self {
            test_case_id: test_case_id.into(),
            outcome,
            message,
        }
    }
}

/// Aggregate counts over a verdict list
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Statistics {
    pub total_tests: usize,
    pub passed_tests: usize,
    /// Percentage in [0, 100]
    pub success_rate: f64,
}

/// Custom error types for testbox
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No sandbox slot or host resources; callers retry with backoff
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Request queue is full
    #[error("Service busy: {0}")]
    ServiceBusy(String),

    #[error("Sandbox crashed: {0}")]
    SandboxCrash(String),

    #[error("Wall clock limit of {0} ms exceeded")]
    Timeout(u64),

    #[error("Malformed output: {0}")]
    MalformedOutput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Filesystem error: {0}")]
    Filesystem(String),
}

impl SandboxError {
    /// Host refused a new environment (ENOSPC, EMFILE, ENFILE, EAGAIN, ENOMEM)
    pub fn is_exhaustion_errno(errno: i32) -> bool {
        matches!(
            errno,
            libc::ENOSPC | libc::EMFILE | libc::ENFILE | libc::EAGAIN | libc::ENOMEM
        )
    }

    /// Convert an I/O failure, promoting host exhaustion to `ResourceExhausted`
    pub fn from_io(context: &str, err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(errno) if Self::is_exhaustion_errno(errno) => {
                SandboxError::ResourceExhausted(format!("{}: {}", context, err))
            }
            _ => SandboxError::Io(std::io::Error::new(
                err.kind(),
                format!("{}: {}", context, err),
            )),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, SandboxError::ResourceExhausted(_))
    }
}

impl From<nix::errno::Errno> for SandboxError {
    fn from(err: nix::errno::Errno) -> Self {
        if Self::is_exhaustion_errno(err as i32) {
            SandboxError::ResourceExhausted(err.to_string())
        } else {
            SandboxError::Process(err.to_string())
        }
    }
}

/// Result type alias for testbox operations
pub type Result<T> = std::result::Result<T, SandboxError>;
