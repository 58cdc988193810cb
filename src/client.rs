/// Batch evaluation client
///
/// Drives a running server from a JSONL file of `{task_id, solution}`
/// entries. Test cases for a task live in `<tests_dir>/<task_id>/tests.json`.
/// Per-task failures become `status: error` entries; only an unreachable
/// server or an unreadable input aborts the batch.
use crate::config::types::{Statistics, Submission, TestCase, Verdict, DEFAULT_LANGUAGE};
use crate::server::service::{Evaluation, EvaluationRequest};
use anyhow::{bail, Context, Result};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const TESTS_FILE: &str = "tests.json";

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub input: PathBuf,
    pub tests_dir: PathBuf,
    pub results: PathBuf,
    pub summary: PathBuf,
    pub server_url: String,
    pub concurrency: usize,
    pub auth_token: Option<String>,
    pub timeout: Duration,
}

/// One line of the input file
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BatchEntry {
    pub task_id: String,
    pub solution: String,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Evaluated,
    Error,
}

/// One line of the results file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<Statistics>,
    #[serde(default)]
    pub verdicts: Vec<Verdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResult {
    fn evaluated(evaluation: Evaluation) -> Self {
        Self {
            task_id: evaluation.task_id,
            status: TaskStatus::Evaluated,
            statistics: Some(evaluation.statistics),
            verdicts: evaluation.verdicts,
            error: None,
        }
    }

    fn failed(task_id: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Error,
            statistics: None,
            verdicts: Vec::new(),
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BatchSummary {
    pub total_entries: usize,
    pub evaluated: usize,
    pub errored: usize,
    pub tests_run: usize,
    pub tests_passed: usize,
    /// Percentage of passed tests over all tests run
    pub success_rate: f64,
}

pub fn summarize(results: &[TaskResult]) -> BatchSummary {
    let mut summary = BatchSummary {
        total_entries: results.len(),
        ..BatchSummary::default()
    };
    for result in results {
        match result.status {
            TaskStatus::Evaluated => summary.evaluated += 1,
            TaskStatus::Error => summary.errored += 1,
        }
        if let Some(stats) = &result.statistics {
            summary.tests_run += stats.total_tests;
            summary.tests_passed += stats.passed_tests;
        }
    }
    if summary.tests_run > 0 {
        summary.success_rate = summary.tests_passed as f64 * 100.0 / summary.tests_run as f64;
    }
    summary
}

/// HTTP client for one testbox server
#[derive(Debug, Clone)]
pub struct EvaluationClient {
    base_url: String,
    client: reqwest::Client,
    auth_token: Option<String>,
    timeout: Duration,
}

impl EvaluationClient {
    pub fn new(base_url: &str, auth_token: Option<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            auth_token,
            timeout,
        }
    }

    pub async fn health_check(&self) -> Result<()> {
        let health_url = format!("{}/health", self.base_url);
        let response = self
            .client
            .get(&health_url)
            .timeout(self.timeout)
            .send()
            .await
            .with_context(|| format!("server at {} is unreachable", self.base_url))?;

        if !response.status().is_success() {
            bail!("Health check failed: {}", response.status());
        }
        Ok(())
    }

    pub async fn evaluate(&self, request: &EvaluationRequest) -> Result<Evaluation> {
        let evaluate_url = format!("{}/evaluate", self.base_url);
        let mut builder = self
            .client
            .post(&evaluate_url)
            .timeout(self.timeout)
            .json(request);
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body: serde_json::Value = response.json().await.unwrap_or_default();
            let code = body["error"].as_str().unwrap_or("unknown");
            let message = body["message"].as_str().unwrap_or("");
            bail!("server returned {} ({}): {}", status, code, message);
        }
        Ok(response.json().await?)
    }
}

/// Parse the input file. Unparsable lines become per-entry errors tagged
/// with their line number.
pub fn read_entries(path: &Path) -> Result<Vec<std::result::Result<BatchEntry, TaskResult>>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read input file {}", path.display()))?;

    Ok(content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str::<BatchEntry>(line).map_err(|e| {
                TaskResult::failed(format!("line {}", index + 1), format!("invalid entry: {}", e))
            })
        })
        .collect())
}

/// Load `<tests_dir>/<task_id>/tests.json`
pub fn load_test_cases(tests_dir: &Path, task_id: &str) -> Result<Vec<TestCase>> {
    let component = Path::new(task_id);
    if task_id.is_empty()
        || component.components().count() != 1
        || !matches!(
            component.components().next(),
            Some(std::path::Component::Normal(_))
        )
    {
        bail!("task id '{}' cannot be used as a directory name", task_id);
    }

    let path = tests_dir.join(task_id).join(TESTS_FILE);
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("no test cases at {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("invalid test cases in {}", path.display()))
}

async fn evaluate_entry(client: &EvaluationClient, tests_dir: &Path, entry: BatchEntry) -> TaskResult {
    let test_cases = match load_test_cases(tests_dir, &entry.task_id) {
        Ok(cases) => cases,
        Err(e) => return TaskResult::failed(entry.task_id, format!("{:#}", e)),
    };
    let request = EvaluationRequest {
        submission: Submission {
            task_id: entry.task_id.clone(),
            code: entry.solution,
            language: entry
                .language
                .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
        },
        test_cases,
    };

    match client.evaluate(&request).await {
        Ok(evaluation) => TaskResult::evaluated(evaluation),
        Err(e) => {
            log::warn!("Task {}: {:#}", entry.task_id, e);
            TaskResult::failed(entry.task_id, format!("{:#}", e))
        }
    }
}

/// Evaluate every entry, in input order, with bounded concurrency
pub async fn run_batch(options: &BatchOptions) -> Result<BatchSummary> {
    let entries = read_entries(&options.input)?;
    let client = EvaluationClient::new(
        &options.server_url,
        options.auth_token.clone(),
        options.timeout,
    );
    client.health_check().await?;
    log::info!(
        "Evaluating {} entries against {} ({} at a time)",
        entries.len(),
        options.server_url,
        options.concurrency
    );

    let results: Vec<TaskResult> = stream::iter(entries)
        .map(|entry| {
            let client = &client;
            async move {
                match entry {
                    Ok(entry) => evaluate_entry(client, &options.tests_dir, entry).await,
                    Err(failed) => failed,
                }
            }
        })
        .buffered(options.concurrency.max(1))
        .collect()
        .await;

    write_results(&options.results, &results)?;
    let summary = summarize(&results);
    std::fs::write(&options.summary, serde_json::to_string_pretty(&summary)?)
        .with_context(|| format!("Failed to write summary {}", options.summary.display()))?;

    log::info!(
        "Batch done: {} evaluated, {} errored, {}/{} tests passed",
        summary.evaluated,
        summary.errored,
        summary.tests_passed,
        summary.tests_run
    );
    Ok(summary)
}

fn write_results(path: &Path, results: &[TaskResult]) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create results file {}", path.display()))?;
    let mut writer = std::io::BufWriter::new(file);
    for result in results {
        serde_json::to_writer(&mut writer, result)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::Outcome;

    #[test]
    fn test_read_entries_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.jsonl");
        std::fs::write(
            &input,
            "{\"task_id\": \"a\", \"solution\": \"x = 1\"}\n\n{broken\n{\"task_id\": \"b\", \"solution\": \"\", \"language\": \"py\"}\n",
        )
        .unwrap();

        let entries = read_entries(&input).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].as_ref().unwrap().task_id, "a");
        let failed = entries[1].as_ref().unwrap_err();
        assert_eq!(failed.task_id, "line 3");
        assert_eq!(failed.status, TaskStatus::Error);
        assert_eq!(entries[2].as_ref().unwrap().language.as_deref(), Some("py"));
    }

    #[test]
    fn test_missing_input_is_fatal() {
        assert!(read_entries(Path::new("/nonexistent/input.jsonl")).is_err());
    }

    #[test]
    fn test_load_test_cases() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("task-1")).unwrap();
        std::fs::write(
            dir.path().join("task-1").join(TESTS_FILE),
            r#"[{"id": "t1", "check": {"kind": "assertion", "code": "assert True"}}]"#,
        )
        .unwrap();

        let cases = load_test_cases(dir.path(), "task-1").unwrap();
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].id, "t1");

        assert!(load_test_cases(dir.path(), "task-2").is_err());
        assert!(load_test_cases(dir.path(), "../task-1").is_err());
        assert!(load_test_cases(dir.path(), "").is_err());
    }

    #[test]
    fn test_summarize() {
        let results = vec![
            TaskResult {
                task_id: "a".to_string(),
                status: TaskStatus::Evaluated,
                statistics: Some(Statistics {
                    total_tests: 3,
                    passed_tests: 2,
                    success_rate: 66.7,
                }),
                verdicts: vec![Verdict::new("t1", Outcome::Pass, None)],
                error: None,
            },
            TaskResult::failed("b", "no test cases"),
        ];

        let summary = summarize(&results);
        assert_eq!(summary.total_entries, 2);
        assert_eq!(summary.evaluated, 1);
        assert_eq!(summary.errored, 1);
        assert_eq!(summary.tests_run, 3);
        assert_eq!(summary.tests_passed, 2);
        assert_eq!(summarize(&[]).success_rate, 0.0);
    }

    #[test]
    fn test_error_result_serialization() {
        let line = serde_json::to_value(TaskResult::failed("b", "boom")).unwrap();
        assert_eq!(line["status"], "error");
        assert_eq!(line["error"], "boom");
        assert!(line.get("statistics").is_none());
    }

    #[tokio::test]
    async fn test_unreachable_server_aborts_batch() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.jsonl");
        std::fs::write(&input, "{\"task_id\": \"a\", \"solution\": \"\"}\n").unwrap();

        let options = BatchOptions {
            input,
            tests_dir: dir.path().to_path_buf(),
            results: dir.path().join("results.jsonl"),
            summary: dir.path().join("summary.json"),
            // Port 9 (discard) is closed on test hosts
            server_url: "http://127.0.0.1:9".to_string(),
            concurrency: 2,
            auth_token: None,
            timeout: Duration::from_secs(2),
        };
        assert!(run_batch(&options).await.is_err());
        assert!(!options.results.exists());
    }
}
