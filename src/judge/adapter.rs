use crate::config::types::{Result, SandboxError, TestCase};
use crate::core::backend::RuntimeView;
use uuid::Uuid;

/// Judge adapter contract: which files a run needs and how to start it.
pub trait JudgeAdapter: Send + Sync {
    fn language(&self) -> &'static str;
    fn source_file(&self) -> &'static str;
    fn harness_file(&self) -> &'static str;
    fn cases_file(&self) -> &'static str {
        "cases.json"
    }
    fn harness_source(&self) -> &'static str;
    /// argv for the payload; `marker` prefixes every result record
    fn run_command(&self, runtime: &RuntimeView, marker: &str) -> Vec<String>;

    fn render_cases(&self, test_cases: &[TestCase]) -> Result<String> {
        serde_json::to_string(test_cases).map_err(|e| {
            SandboxError::InvalidRequest(format!("test cases cannot be serialized: {}", e))
        })
    }
}

/// Fresh per-run record marker
pub fn new_record_marker() -> String {
    format!("@@testbox:{}@@", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markers_are_unique() {
        let a = new_record_marker();
        let b = new_record_marker();
        assert_ne!(a, b);
        assert!(a.starts_with("@@testbox:"));
        assert!(a.ends_with("@@"));
    }
}
