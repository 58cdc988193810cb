//! End-to-end evaluation through the process backend
//!
//! Runs real submissions under python3. Every test returns early when the
//! host has no python3.

use std::path::Path;
use std::process::Command;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use testbox::config::config::{BackendSection, ServerSection};
use testbox::core::process::ProcessBackend;
use testbox::server::{EvaluationRequest, Evaluator};
use testbox::{Check, ExecutionStatus, Outcome, ResourceLimits, Submission, TestCase};

fn python_available() -> bool {
    Command::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn evaluator(root: &Path, capacity: usize) -> Evaluator {
    let config = BackendSection {
        work_root: root.to_path_buf(),
        use_cgroups: false,
        ..BackendSection::default()
    };
    let backend = Arc::new(ProcessBackend::new(&config, capacity).unwrap());
    let limits = ResourceLimits {
        cpu_time_limit_seconds: 2,
        wall_clock_timeout_seconds: 3,
        // RLIMIT_NPROC counts every process of the test user
        max_processes: 4096,
        ..ResourceLimits::default()
    };
    Evaluator::new(backend, limits, &ServerSection::default())
}

fn assertion(id: &str, code: &str) -> TestCase {
    TestCase {
        id: id.to_string(),
        fixture: None,
        check: Check::Assertion {
            code: code.to_string(),
        },
    }
}

fn request(code: &str, test_cases: Vec<TestCase>) -> EvaluationRequest {
    EvaluationRequest {
        submission: Submission {
            task_id: "task-1".to_string(),
            code: code.to_string(),
            language: "python".to_string(),
        },
        test_cases,
    }
}

fn outcomes(evaluator: &Evaluator, request: &EvaluationRequest) -> Vec<Outcome> {
    evaluator
        .evaluate(request, "req", &AtomicBool::new(false))
        .unwrap()
        .verdicts
        .iter()
        .map(|v| v.outcome)
        .collect()
}

const IDENTITY: &str = "def identity(x):\n    return x\n";

#[test]
fn test_pass_and_fail() {
    if !python_available() {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let evaluator = evaluator(root.path(), 1);
    let request = request(
        IDENTITY,
        vec![
            assertion("same", "assert identity(5) == 5"),
            assertion("different", "assert identity(5) == 6"),
        ],
    );

    let evaluation = evaluator
        .evaluate(&request, "req", &AtomicBool::new(false))
        .unwrap();
    let outcomes: Vec<Outcome> = evaluation.verdicts.iter().map(|v| v.outcome).collect();
    assert_eq!(outcomes, vec![Outcome::Pass, Outcome::Fail]);
    assert_eq!(evaluation.verdicts[0].test_case_id, "same");
    assert_eq!(evaluation.statistics.passed_tests, 1);
    assert!((evaluation.statistics.success_rate - 50.0).abs() < f64::EPSILON);
    assert_eq!(
        evaluation.execution.unwrap().status,
        ExecutionStatus::Ok
    );
}

#[test]
fn test_expected_output_and_fixture() {
    if !python_available() {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let evaluator = evaluator(root.path(), 1);
    let request = request(
        IDENTITY,
        vec![
            TestCase {
                id: "printed".to_string(),
                fixture: Some("value = 'hello'".to_string()),
                check: Check::ExpectedOutput {
                    code: "print(identity(value))".to_string(),
                    expected: "hello\n\n".to_string(),
                },
            },
            TestCase {
                id: "wrong".to_string(),
                fixture: None,
                check: Check::ExpectedOutput {
                    code: "print(identity(1))".to_string(),
                    expected: "2".to_string(),
                },
            },
        ],
    );
    assert_eq!(
        outcomes(&evaluator, &request),
        vec![Outcome::Pass, Outcome::Fail]
    );
}

#[test]
fn test_infinite_loop_times_out_every_test() {
    if !python_available() {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let evaluator = evaluator(root.path(), 1);
    let code = "def identity(x):\n    while True:\n        pass\n";
    let request = request(
        code,
        vec![
            assertion("a", "assert identity(5) == 5"),
            assertion("b", "assert identity(6) == 6"),
        ],
    );

    let evaluation = evaluator
        .evaluate(&request, "req", &AtomicBool::new(false))
        .unwrap();
    let outcomes: Vec<Outcome> = evaluation.verdicts.iter().map(|v| v.outcome).collect();
    assert_eq!(outcomes, vec![Outcome::Timeout, Outcome::Timeout]);
    assert_eq!(
        evaluation.execution.unwrap().status,
        ExecutionStatus::TimeLimit
    );
}

#[test]
fn test_sleeping_submission_hits_wall_clock() {
    if !python_available() {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let evaluator = evaluator(root.path(), 1);
    // Sleeps use almost no CPU, so only the wall clock can stop this
    let code = "import time\n\ndef identity(x):\n    while True:\n        time.sleep(0.01)\n";
    let request = request(
        code,
        vec![
            assertion("a", "assert identity(5) == 5"),
            assertion("b", "assert identity(6) == 6"),
        ],
    );

    let first = evaluator
        .evaluate(&request, "req-1", &AtomicBool::new(false))
        .unwrap();
    let outcomes: Vec<Outcome> = first.verdicts.iter().map(|v| v.outcome).collect();
    assert_eq!(outcomes, vec![Outcome::Timeout, Outcome::Timeout]);
    let execution = first.execution.clone().unwrap();
    assert!(execution.timed_out);
    assert_eq!(execution.exit_code, Some(124));
    assert_eq!(execution.status, ExecutionStatus::TimeLimit);

    let second = evaluator
        .evaluate(&request, "req-2", &AtomicBool::new(false))
        .unwrap();
    assert_eq!(first.verdicts, second.verdicts);
}

#[test]
fn test_crash_keeps_earlier_verdicts() {
    if !python_available() {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let evaluator = evaluator(root.path(), 1);
    let code = "import os\n\ndef identity(x):\n    return x\n\ndef crash():\n    os.kill(os.getpid(), 9)\n";
    let request = request(
        code,
        vec![
            assertion("before", "assert identity(1) == 1"),
            assertion("crash", "crash()"),
            assertion("after", "assert identity(2) == 2"),
        ],
    );

    let evaluation = evaluator
        .evaluate(&request, "req", &AtomicBool::new(false))
        .unwrap();
    let outcomes: Vec<Outcome> = evaluation.verdicts.iter().map(|v| v.outcome).collect();
    assert_eq!(outcomes, vec![Outcome::Pass, Outcome::Error, Outcome::Error]);
    assert!(evaluation.verdicts[1]
        .message
        .as_deref()
        .unwrap()
        .contains("SIGKILL"));
}

#[test]
fn test_solution_that_fails_to_load() {
    if !python_available() {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let evaluator = evaluator(root.path(), 1);
    let request = request(
        "raise RuntimeError('nope')\n",
        vec![assertion("a", "assert True"), assertion("b", "assert True")],
    );
    assert_eq!(
        outcomes(&evaluator, &request),
        vec![Outcome::Error, Outcome::Error]
    );
}

#[test]
fn test_resubmission_is_deterministic() {
    if !python_available() {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let evaluator = evaluator(root.path(), 1);
    let request = request(
        IDENTITY,
        vec![
            assertion("a", "assert identity(5) == 5"),
            assertion("b", "assert identity(5) == 6"),
            assertion("c", "identity()"),
        ],
    );

    let first = evaluator
        .evaluate(&request, "req-1", &AtomicBool::new(false))
        .unwrap();
    let second = evaluator
        .evaluate(&request, "req-2", &AtomicBool::new(false))
        .unwrap();
    assert_eq!(first.verdicts, second.verdicts);
}

#[test]
fn test_crashing_and_healthy_submissions_run_side_by_side() {
    if !python_available() {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let evaluator = Arc::new(evaluator(root.path(), 2));

    let crashing = request(
        "import os\nos.kill(os.getpid(), 9)\n",
        vec![assertion("a", "assert True")],
    );
    let healthy = request(IDENTITY, vec![assertion("a", "assert identity(3) == 3")]);

    let handles: Vec<_> = [crashing, healthy]
        .into_iter()
        .map(|request| {
            let evaluator = Arc::clone(&evaluator);
            std::thread::spawn(move || outcomes(&evaluator, &request))
        })
        .collect();
    let results: Vec<Vec<Outcome>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results[0], vec![Outcome::Error]);
    assert_eq!(results[1], vec![Outcome::Pass]);
}

#[test]
fn test_workspaces_are_removed() {
    if !python_available() {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let evaluator = evaluator(root.path(), 1);
    let request = request(IDENTITY, vec![assertion("a", "assert identity(0) == 0")]);
    let _ = evaluator.evaluate(&request, "req", &AtomicBool::new(false));

    assert_eq!(evaluator.backend().active_sandboxes(), 0);
    assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
}
