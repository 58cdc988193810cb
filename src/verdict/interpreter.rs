/// Result interpretation
///
/// Maps one ExecutionResult plus the declared test cases to one verdict per
/// test, in declaration order. Pure: same input, same verdicts.
use crate::config::types::{
    ExecutionResult, ExecutionStatus, Outcome, SandboxError, Statistics, TestCase, Verdict,
};
use crate::kernel::signal::signal_name;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Record {
    id: String,
    outcome: String,
    #[serde(default)]
    message: Option<String>,
}

pub fn interpret(result: &ExecutionResult, test_cases: &[TestCase]) -> Vec<Verdict> {
    let (mut verdicts, malformed) = parse_records(result, test_cases);

    if verdicts.len() < test_cases.len() {
        let (outcome, message) = unreported(result, malformed.as_ref());
        for case in &test_cases[verdicts.len()..] {
            verdicts.push(Verdict::new(case.id.clone(), outcome, Some(message.clone())));
        }
    }
    verdicts
}

/// Parse records up to the first violation.
/// Returns the verdicts parsed so far and the violation, if any.
fn parse_records(
    result: &ExecutionResult,
    test_cases: &[TestCase],
) -> (Vec<Verdict>, Option<SandboxError>) {
    let mut verdicts = Vec::with_capacity(test_cases.len());
    let marker = result.record_marker.as_str();
    if marker.is_empty() {
        return (verdicts, None);
    }

    // A line without its newline was cut off mid-write
    let complete = match result.stdout.rfind('\n') {
        Some(end) => &result.stdout[..=end],
        None => "",
    };

    for line in complete.lines() {
        let Some(body) = line.strip_prefix(marker) else {
            continue;
        };
        let Some(expected) = test_cases.get(verdicts.len()) else {
            break;
        };
        match parse_record(body, expected) {
            Ok(verdict) => verdicts.push(verdict),
            Err(e) => return (verdicts, Some(e)),
        }
    }
    (verdicts, None)
}

fn parse_record(body: &str, expected: &TestCase) -> Result<Verdict, SandboxError> {
    let record: Record = serde_json::from_str(body).map_err(|e| {
        SandboxError::MalformedOutput(format!(
            "record for test '{}' is not valid JSON: {}",
            expected.id, e
        ))
    })?;

    if record.id != expected.id {
        return Err(SandboxError::MalformedOutput(format!(
            "expected record for test '{}', found '{}'",
            expected.id, record.id
        )));
    }

    let outcome = match record.outcome.as_str() {
        "pass" => Outcome::Pass,
        "fail" => Outcome::Fail,
        "error" => Outcome::Error,
        other => {
            return Err(SandboxError::MalformedOutput(format!(
                "unknown outcome '{}' for test '{}'",
                other, expected.id
            )))
        }
    };
    Ok(Verdict::new(record.id, outcome, record.message))
}

/// Outcome and diagnostic for tests the run never reported
fn unreported(result: &ExecutionResult, malformed: Option<&SandboxError>) -> (Outcome, String) {
    if result.timed_out {
        // Measured wall time stays in the execution summary; verdicts must
        // not vary between identical runs
        return (Outcome::Timeout, "wall-clock limit exceeded".to_string());
    }
    if result.cpu_limit_exceeded() {
        return (Outcome::Timeout, "CPU time limit exceeded".to_string());
    }
    if result.status == ExecutionStatus::TimeLimit {
        return (Outcome::Timeout, "time limit exceeded".to_string());
    }

    let message = if let Some(err) = malformed {
        err.to_string()
    } else if result.oom_killed || result.status == ExecutionStatus::MemoryLimit {
        "memory limit exceeded".to_string()
    } else if let Some(signal) = result.signal {
        SandboxError::SandboxCrash(format!("terminated by {}", signal_name(signal))).to_string()
    } else if result.status == ExecutionStatus::InternalError {
        format!(
            "sandbox failure: {}",
            result.error_message.as_deref().unwrap_or("unknown")
        )
    } else if result.output_truncated {
        "output limit exceeded; result records were discarded".to_string()
    } else if let Some(code) = result.exit_code.filter(|code| *code != 0) {
        match last_stderr_line(&result.stderr) {
            Some(line) => format!("exited with status {}: {}", code, line),
            None => format!("exited with status {}", code),
        }
    } else {
        "no result record produced".to_string()
    };
    (Outcome::Error, message)
}

fn last_stderr_line(stderr: &str) -> Option<&str> {
    stderr.lines().rev().map(str::trim).find(|line| !line.is_empty())
}

pub fn statistics(verdicts: &[Verdict]) -> Statistics {
    let total_tests = verdicts.len();
    let passed_tests = verdicts
        .iter()
        .filter(|v| v.outcome == Outcome::Pass)
        .count();
    let success_rate = if total_tests == 0 {
        0.0
    } else {
        passed_tests as f64 * 100.0 / total_tests as f64
    };

    Statistics {
        total_tests,
        passed_tests,
        success_rate,
    }
}
