/// Evaluation service
///
/// `evaluate(Submission, [TestCase]) -> Evaluation`: validate, acquire a
/// sandbox (retrying host exhaustion with exponential backoff), run,
/// interpret, and release the sandbox on every path. Blocking; the HTTP
/// layer runs it on the blocking thread pool.
use crate::config::config::ServerSection;
use crate::config::types::{
    ExecutionSummary, ResourceLimits, Result, SandboxError, Statistics, Submission, TestCase,
    Verdict,
};
use crate::core::backend::IsolationBackend;
use crate::core::handle::SandboxHandle;
use crate::exec::ExecutionDriver;
use crate::judge;
use crate::observability::audit::{self, CorrelationIds};
use crate::observability::metrics::get_metrics;
use crate::verdict::{interpret, statistics};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Body of `POST /evaluate` and of `testbox run --request`
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EvaluationRequest {
    pub submission: Submission,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Evaluation {
    pub task_id: String,
    pub request_id: String,
    pub verdicts: Vec<Verdict>,
    pub statistics: Statistics,
    /// Absent when no sandbox was needed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionSummary>,
}

pub struct Evaluator {
    driver: ExecutionDriver,
    limits: ResourceLimits,
    acquire_retries: u32,
    retry_backoff: Duration,
}

impl Evaluator {
    pub fn new(
        backend: Arc<dyn IsolationBackend>,
        limits: ResourceLimits,
        server: &ServerSection,
    ) -> Self {
        Self {
            driver: ExecutionDriver::new(backend),
            limits,
            acquire_retries: server.acquire_retries,
            retry_backoff: Duration::from_millis(server.retry_backoff_ms),
        }
    }

    pub fn backend(&self) -> &Arc<dyn IsolationBackend> {
        self.driver.backend()
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Reject requests that cannot be evaluated before any sandbox exists
    pub fn validate(request: &EvaluationRequest) -> Result<()> {
        if request.submission.task_id.trim().is_empty() {
            return Err(SandboxError::InvalidRequest(
                "submission.task_id must not be empty".to_string(),
            ));
        }
        judge::adapter_for(&request.submission.language)?;

        let mut seen = HashSet::new();
        for case in &request.test_cases {
            if case.id.trim().is_empty() {
                return Err(SandboxError::InvalidRequest(
                    "test case id must not be empty".to_string(),
                ));
            }
            if !seen.insert(case.id.as_str()) {
                return Err(SandboxError::InvalidRequest(format!(
                    "duplicate test case id '{}'",
                    case.id
                )));
            }
        }
        Ok(())
    }

    /// Evaluate one submission in one fresh sandbox.
    ///
    /// Per-submission failures come back as verdicts. Errors are reserved for
    /// invalid requests and for sandboxes the host could not provide.
    pub fn evaluate(
        &self,
        request: &EvaluationRequest,
        request_id: &str,
        cancel: &AtomicBool,
    ) -> Result<Evaluation> {
        Self::validate(request)?;
        let metrics = get_metrics();
        let submission = &request.submission;
        let test_cases = &request.test_cases;

        if test_cases.is_empty() {
            log::debug!(
                "Request {}: task {} has no tests, skipping sandbox",
                request_id,
                submission.task_id
            );
            metrics.evaluations_completed.inc();
            return Ok(Evaluation {
                task_id: submission.task_id.clone(),
                request_id: request_id.to_string(),
                verdicts: Vec::new(),
                statistics: statistics(&[]),
                execution: None,
            });
        }

        let started = Instant::now();
        let correlation = CorrelationIds::default()
            .with_request(request_id)
            .with_task(&submission.task_id);
        let mut handle = self.acquire(&correlation)?;
        handle.label(request_id, &submission.task_id);

        let run = self.driver.run(&mut handle, submission, test_cases, cancel);
        let sandbox_id = handle.id().to_string();
        if let Err(e) = self.backend().release(handle) {
            // Verdicts stand; the failure is already audited
            log::error!("Request {}: {}", request_id, e);
        }
        let result = run?;

        let verdicts = interpret(&result, test_cases);
        let stats = statistics(&verdicts);
        metrics.record_execution(result.status);
        for verdict in &verdicts {
            metrics.record_verdict(verdict.outcome);
        }
        metrics.evaluation_duration.observe(started.elapsed());
        metrics.evaluations_completed.inc();

        log::info!(
            "Request {}: task {} in sandbox {}: {} ({}/{} passed, {}ms)",
            request_id,
            submission.task_id,
            sandbox_id,
            result.status,
            stats.passed_tests,
            stats.total_tests,
            result.wall_time_ms
        );

        Ok(Evaluation {
            task_id: submission.task_id.clone(),
            request_id: request_id.to_string(),
            verdicts,
            statistics: stats,
            execution: Some(ExecutionSummary::from(&result)),
        })
    }

    fn acquire(&self, correlation: &CorrelationIds) -> Result<SandboxHandle> {
        let mut attempt = 0u32;
        loop {
            match self.backend().acquire(&self.limits) {
                Ok(handle) => return Ok(handle),
                Err(e) if e.is_retryable() && attempt < self.acquire_retries => {
                    attempt += 1;
                    let delay = self.backoff(attempt);
                    log::warn!(
                        "Sandbox acquire failed ({}), retry {}/{} in {:?}",
                        e,
                        attempt,
                        self.acquire_retries,
                        delay
                    );
                    get_metrics().acquire_retries.inc();
                    audit::events::acquire_retry(correlation, attempt, &e.to_string());
                    std::thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Delay before retry `attempt` (1-based): base, 2x base, 4x base, ...
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.retry_backoff.saturating_mul(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::config::BackendSection;
    use crate::config::types::Check;
    use crate::core::process::ProcessBackend;

    fn evaluator(root: &std::path::Path, capacity: usize, retries: u32) -> Evaluator {
        let config = BackendSection {
            work_root: root.to_path_buf(),
            use_cgroups: false,
            ..BackendSection::default()
        };
        let backend = Arc::new(ProcessBackend::new(&config, capacity).unwrap());
        let server = ServerSection {
            acquire_retries: retries,
            retry_backoff_ms: 1,
            ..ServerSection::default()
        };
        Evaluator::new(backend, ResourceLimits::default(), &server)
    }

    fn request(task_id: &str, ids: &[&str]) -> EvaluationRequest {
        EvaluationRequest {
            submission: Submission {
                task_id: task_id.to_string(),
                code: "def f(x):\n    return x\n".to_string(),
                language: "python".to_string(),
            },
            test_cases: ids
                .iter()
                .map(|id| TestCase {
                    id: id.to_string(),
                    fixture: None,
                    check: Check::Assertion {
                        code: "assert f(1) == 1".to_string(),
                    },
                })
                .collect(),
        }
    }

    #[test]
    fn test_validation() {
        assert!(Evaluator::validate(&request("t", &["a", "b"])).is_ok());

        let err = Evaluator::validate(&request(" ", &["a"])).unwrap_err();
        assert!(matches!(err, SandboxError::InvalidRequest(_)));

        let err = Evaluator::validate(&request("t", &["a", "a"])).unwrap_err();
        assert!(err.to_string().contains("duplicate"));

        let mut ruby = request("t", &["a"]);
        ruby.submission.language = "ruby".to_string();
        assert!(matches!(
            Evaluator::validate(&ruby),
            Err(SandboxError::UnsupportedLanguage(_))
        ));
    }

    #[test]
    fn test_zero_tests_skip_the_sandbox() {
        let root = tempfile::tempdir().unwrap();
        let evaluator = evaluator(root.path(), 1, 0);
        let evaluation = evaluator
            .evaluate(&request("t", &[]), "req-1", &AtomicBool::new(false))
            .unwrap();
        assert!(evaluation.verdicts.is_empty());
        assert!(evaluation.execution.is_none());
        assert_eq!(evaluation.statistics.total_tests, 0);
        assert_eq!(evaluator.backend().active_sandboxes(), 0);
    }

    #[test]
    fn test_exhaustion_surfaces_after_retries() {
        let root = tempfile::tempdir().unwrap();
        let evaluator = evaluator(root.path(), 1, 2);
        let held = evaluator.backend().acquire(&ResourceLimits::default()).unwrap();

        let err = evaluator
            .evaluate(&request("t", &["a"]), "req-2", &AtomicBool::new(false))
            .unwrap_err();
        assert!(err.is_retryable());

        evaluator.backend().release(held).unwrap();
    }

    #[test]
    fn test_backoff_doubles() {
        let root = tempfile::tempdir().unwrap();
        let mut evaluator = evaluator(root.path(), 1, 3);
        evaluator.retry_backoff = Duration::from_millis(50);
        assert_eq!(evaluator.backoff(1), Duration::from_millis(50));
        assert_eq!(evaluator.backoff(2), Duration::from_millis(100));
        assert_eq!(evaluator.backoff(3), Duration::from_millis(200));
    }

    #[test]
    fn test_sandbox_released_after_evaluation() {
        let root = tempfile::tempdir().unwrap();
        let evaluator = evaluator(root.path(), 1, 0);
        // Missing interpreter or not, the slot must come back
        let _ = evaluator.evaluate(&request("t", &["a"]), "req-3", &AtomicBool::new(false));
        assert_eq!(evaluator.backend().active_sandboxes(), 0);
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }
}
