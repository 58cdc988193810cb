use crate::core::backend::RuntimeView;
use crate::judge::adapter::JudgeAdapter;

const HARNESS: &str = include_str!("python_harness.py");

#[derive(Debug, Clone, Default)]
pub struct PythonAdapter;

impl JudgeAdapter for PythonAdapter {
    fn language(&self) -> &'static str {
        "python"
    }

    fn source_file(&self) -> &'static str {
        "solution.py"
    }

    fn harness_file(&self) -> &'static str {
        "harness.py"
    }

    fn harness_source(&self) -> &'static str {
        HARNESS
    }

    fn run_command(&self, runtime: &RuntimeView, marker: &str) -> Vec<String> {
        // -I: no user site, no PYTHON* env, no script dir on sys.path
        // -B: nothing may be written next to the sources
        vec![
            runtime.interpreter.clone(),
            "-I".to_string(),
            "-B".to_string(),
            self.harness_file().to_string(),
            marker.to_string(),
        ]
    }
}
