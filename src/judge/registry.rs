use crate::config::types::{Result, SandboxError};
use crate::judge::adapter::JudgeAdapter;
use crate::judge::languages::python::PythonAdapter;

pub const SUPPORTED_LANGUAGES: &[&str] = &["python"];

pub fn adapter_for(language: &str) -> Result<Box<dyn JudgeAdapter>> {
    match language.trim().to_ascii_lowercase().as_str() {
        "python" | "python3" | "py" => Ok(Box::new(PythonAdapter)),
        _ => Err(SandboxError::UnsupportedLanguage(format!(
            "'{}' is not supported (supported: {})",
            language,
            SUPPORTED_LANGUAGES.join(", ")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_python_aliases() {
        for alias in ["python", "python3", "py", "Python"] {
            assert_eq!(adapter_for(alias).unwrap().language(), "python");
        }
    }

    #[test]
    fn test_unknown_language() {
        let err = adapter_for("cobol").err().unwrap();
        assert!(matches!(err, SandboxError::UnsupportedLanguage(_)));
    }
}
