/// Execution driver
///
/// Runs one submission inside one sandbox: writes the solution, the test
/// cases and the harness into the workspace, launches the harness as a single
/// bounded subprocess, enforces the wall-clock ceiling and collects the
/// evidence into an ExecutionResult.
use crate::config::types::{
    ExecutionResult, OutputIntegrity, Result, SandboxError, Submission, TestCase,
};
use crate::core::backend::{ExitEvidence, IsolationBackend};
use crate::core::handle::SandboxHandle;
use crate::judge::{self, JudgeAdapter};
use crate::observability::audit;
use crate::utils::output::{OutputCollector, OutputLimits};
use crate::verdict::{RunEvidence, VerdictClassifier};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Exit code reported for runs killed at the wall-clock ceiling
pub const TIMEOUT_EXIT_CODE: i32 = 124;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

enum WaitOutcome {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
    Failed(SandboxError),
}

pub struct ExecutionDriver {
    backend: Arc<dyn IsolationBackend>,
}

impl ExecutionDriver {
    pub fn new(backend: Arc<dyn IsolationBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn IsolationBackend> {
        &self.backend
    }

    /// Run `submission` against `test_cases` in `handle`.
    ///
    /// Contained failures (launch errors, wait errors, cancellation) come back
    /// as an `IE` result so they turn into error verdicts. Only request errors,
    /// resource exhaustion and handle reuse are returned as `Err`.
    pub fn run(
        &self,
        handle: &mut SandboxHandle,
        submission: &Submission,
        test_cases: &[TestCase],
        cancel: &AtomicBool,
    ) -> Result<ExecutionResult> {
        handle.begin_execution()?;
        let adapter = judge::adapter_for(&submission.language)?;
        let marker = judge::new_record_marker();

        match self.prepare(handle, adapter.as_ref(), submission, test_cases) {
            Ok(()) => {}
            Err(e @ (SandboxError::ResourceExhausted(_) | SandboxError::InvalidRequest(_))) => {
                return Err(e)
            }
            Err(e) => {
                return Ok(ExecutionResult::internal_error(
                    marker,
                    format!("workspace preparation failed: {}", e),
                ))
            }
        }

        let runtime = self.backend.runtime_view(handle);
        let command = adapter.run_command(&runtime, &marker);
        let limits = handle.limits().clone();

        let started = Instant::now();
        let payload = match self.backend.launch(handle, &command) {
            Ok(payload) => payload,
            Err(e @ SandboxError::ResourceExhausted(_)) => return Err(e),
            Err(e) => {
                log::warn!("Sandbox {}: launch failed: {}", handle.id(), e);
                return Ok(ExecutionResult::internal_error(
                    marker,
                    format!("launch failed: {}", e),
                ));
            }
        };
        log::debug!(
            "Sandbox {}: started {} (pid {})",
            handle.id(),
            adapter.language(),
            payload.pid
        );

        let pending = OutputCollector::new(OutputLimits::from_resource_limits(&limits))
            .start(payload.stdout, payload.stderr);

        let timeout = limits.wall_clock_timeout();
        let mut evidence = RunEvidence::default();
        let status = match Self::wait_for_exit(handle, started + timeout, cancel) {
            WaitOutcome::Exited(status) => Some(status),
            WaitOutcome::TimedOut => {
                let timeout_ms = timeout.as_millis() as u64;
                let report = self.backend.terminate(handle);
                log::info!(
                    "Sandbox {}: {}",
                    handle.id(),
                    SandboxError::Timeout(timeout_ms)
                );
                audit::events::wall_clock_kill(handle.correlation(), timeout_ms, report.kill_sent);
                evidence.timed_out = true;
                handle.wait().ok()
            }
            WaitOutcome::Cancelled => {
                self.backend.terminate(handle);
                audit::events::cancel_kill(handle.correlation());
                evidence.cancelled = true;
                handle.wait().ok()
            }
            WaitOutcome::Failed(e) => {
                self.backend.terminate(handle);
                evidence.wait_error = Some(e.to_string());
                handle.wait().ok()
            }
        };

        // Background children may still hold the pipes open
        handle.sweep_process_group();
        let output = pending.finish();
        let wall_time_ms = started.elapsed().as_millis() as u64;

        evidence.exit = match status {
            Some(status) => self.backend.exit_evidence(handle, status),
            None => ExitEvidence::default(),
        };
        let execution_status = VerdictClassifier::classify(&evidence, &limits);

        let error_message = if evidence.cancelled {
            Some("cancelled".to_string())
        } else {
            evidence
                .wait_error
                .clone()
                .or_else(|| evidence.exit.infrastructure_error.clone())
        };
        if output.combined_integrity == OutputIntegrity::CollectionTimeout {
            log::warn!(
                "Sandbox {}: output streams still open after exit",
                handle.id()
            );
        }

        Ok(ExecutionResult {
            status: execution_status,
            exit_code: if evidence.timed_out {
                Some(TIMEOUT_EXIT_CODE)
            } else {
                evidence.exit.exit_code
            },
            signal: evidence.exit.signal,
            output_truncated: output.truncated(),
            output_integrity: output.combined_integrity,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            timed_out: evidence.timed_out,
            oom_killed: evidence.exit.oom_killed,
            wall_time_ms,
            memory_peak: evidence.exit.memory_peak,
            record_marker: marker,
            error_message,
        })
    }

    fn prepare(
        &self,
        handle: &mut SandboxHandle,
        adapter: &dyn JudgeAdapter,
        submission: &Submission,
        test_cases: &[TestCase],
    ) -> Result<()> {
        let cases = adapter.render_cases(test_cases)?;
        let workspace = handle.workspace_mut();
        workspace.write_file(adapter.source_file(), submission.code.as_bytes())?;
        workspace.write_file(adapter.cases_file(), cases.as_bytes())?;
        workspace.write_file(adapter.harness_file(), adapter.harness_source().as_bytes())?;
        Ok(())
    }

    fn wait_for_exit(handle: &mut SandboxHandle, deadline: Instant, cancel: &AtomicBool) -> WaitOutcome {
        loop {
            match handle.try_wait() {
                Ok(Some(status)) => return WaitOutcome::Exited(status),
                Ok(None) => {}
                Err(e) => return WaitOutcome::Failed(e),
            }
            if cancel.load(Ordering::SeqCst) {
                return WaitOutcome::Cancelled;
            }
            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::TimedOut;
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }
}
