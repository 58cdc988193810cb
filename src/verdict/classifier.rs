/// Run-level status classification
///
/// A pure function over what the driver observed: how the payload ended,
/// what the backend saw, and which judge actions were taken.
use crate::config::types::{ExecutionStatus, ResourceLimits};
use crate::core::backend::ExitEvidence;

/// Everything the classifier needs about one run
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunEvidence {
    pub exit: ExitEvidence,
    /// The driver killed the payload at the wall-clock ceiling
    pub timed_out: bool,
    /// The driver killed the payload because the request was cancelled
    pub cancelled: bool,
    /// Waiting on the payload failed
    pub wait_error: Option<String>,
}

pub struct VerdictClassifier;

impl VerdictClassifier {
    pub fn classify(evidence: &RunEvidence, limits: &ResourceLimits) -> ExecutionStatus {
        if evidence.cancelled
            || evidence.wait_error.is_some()
            || evidence.exit.infrastructure_error.is_some()
        {
            return ExecutionStatus::InternalError;
        }

        // Judge actions take precedence: a wall-clock kill surfaces as SIGTERM
        // or SIGKILL, which is not the payload's doing.
        if evidence.timed_out {
            return ExecutionStatus::TimeLimit;
        }

        if evidence.exit.oom_killed {
            return ExecutionStatus::MemoryLimit;
        }

        if let Some(signal) = evidence.exit.signal {
            return Self::classify_signal(evidence, limits, signal);
        }

        match evidence.exit.exit_code {
            Some(0) => ExecutionStatus::Ok,
            Some(_) => ExecutionStatus::RuntimeError,
            None => ExecutionStatus::InternalError,
        }
    }

    fn classify_signal(evidence: &RunEvidence, limits: &ResourceLimits, signal: i32) -> ExecutionStatus {
        if signal == libc::SIGXCPU {
            return ExecutionStatus::TimeLimit;
        }

        // The RLIMIT_CPU hard limit delivers SIGKILL one second after SIGXCPU
        let cpu_limit_ms = limits.cpu_time_limit_seconds.saturating_mul(1000);
        if signal == libc::SIGKILL
            && evidence
                .exit
                .cpu_time_ms
                .is_some_and(|used| used >= cpu_limit_ms)
        {
            return ExecutionStatus::TimeLimit;
        }

        ExecutionStatus::Signaled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exited(code: i32) -> RunEvidence {
        RunEvidence {
            exit: ExitEvidence {
                exit_code: Some(code),
                ..ExitEvidence::default()
            },
            ..RunEvidence::default()
        }
    }

    fn signalled(signal: i32) -> RunEvidence {
        RunEvidence {
            exit: ExitEvidence {
                signal: Some(signal),
                ..ExitEvidence::default()
            },
            ..RunEvidence::default()
        }
    }

    fn classify(evidence: &RunEvidence) -> ExecutionStatus {
        VerdictClassifier::classify(evidence, &ResourceLimits::default())
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(classify(&exited(0)), ExecutionStatus::Ok);
        assert_eq!(classify(&exited(1)), ExecutionStatus::RuntimeError);
    }

    #[test]
    fn test_wall_clock_kill_is_time_limit() {
        let mut evidence = signalled(libc::SIGTERM);
        evidence.timed_out = true;
        assert_eq!(classify(&evidence), ExecutionStatus::TimeLimit);
    }

    #[test]
    fn test_cpu_limit_signals() {
        assert_eq!(classify(&signalled(libc::SIGXCPU)), ExecutionStatus::TimeLimit);

        let mut hard_kill = signalled(libc::SIGKILL);
        hard_kill.exit.cpu_time_ms = Some(10_500);
        assert_eq!(classify(&hard_kill), ExecutionStatus::TimeLimit);

        assert_eq!(classify(&signalled(libc::SIGKILL)), ExecutionStatus::Signaled);
        assert_eq!(classify(&signalled(libc::SIGSEGV)), ExecutionStatus::Signaled);
    }

    #[test]
    fn test_oom_evidence_is_memory_limit() {
        let mut evidence = signalled(libc::SIGKILL);
        evidence.exit.oom_killed = true;
        assert_eq!(classify(&evidence), ExecutionStatus::MemoryLimit);
    }

    #[test]
    fn test_judge_failures_are_internal() {
        let mut cancelled = exited(0);
        cancelled.cancelled = true;
        assert_eq!(classify(&cancelled), ExecutionStatus::InternalError);

        let mut broken = exited(125);
        broken.exit.infrastructure_error = Some("daemon unreachable".to_string());
        assert_eq!(classify(&broken), ExecutionStatus::InternalError);

        assert_eq!(classify(&RunEvidence::default()), ExecutionStatus::InternalError);
    }
}
