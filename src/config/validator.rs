// Startup validation of the service configuration.
// Errors are fatal; warnings are logged and the service starts anyway.

use crate::config::config::{BackendKind, ServiceConfig};
use crate::config::types::{NetworkAccess, Result, SandboxError};

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

/// Validate config at startup, failing fast with every collected error
pub fn validate_config(config: &ServiceConfig) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    validate_server(config, &mut result);
    validate_limits(config, &mut result);
    validate_backend(config, &mut result);

    if !result.is_valid() {
        return Err(SandboxError::Config(format!(
            "Config validation failed:\n{}",
            result.errors.join("\n")
        )));
    }

    for warning in &result.warnings {
        log::warn!("config: {}", warning);
    }

    Ok(result)
}

fn validate_server(config: &ServiceConfig, result: &mut ValidationResult) {
    let server = &config.server;

    if server.port == 0 {
        result.add_error("server.port cannot be zero".to_string());
    }
    if server.max_concurrent_sandboxes == 0 {
        result.add_error("server.max_concurrent_sandboxes must be at least 1".to_string());
    }
    if server.max_queue_depth == 0 {
        result.add_warning(
            "server.max_queue_depth is zero: requests are rejected whenever all slots are busy"
                .to_string(),
        );
    }
    if server.retry_backoff_ms > 10_000 {
        result.add_warning(format!(
            "server.retry_backoff_ms {} is very high and delays every retried request",
            server.retry_backoff_ms
        ));
    }
    if server.max_request_bytes < 1024 {
        result.add_error(format!(
            "server.max_request_bytes {} is too small to carry a request",
            server.max_request_bytes
        ));
    }
    if matches!(server.auth_token.as_deref(), Some(token) if token.trim().is_empty()) {
        result.add_error("server.auth_token is set but empty".to_string());
    }
    if server.auth_token.is_none() && server.host != "127.0.0.1" && server.host != "localhost" {
        result.add_warning(format!(
            "server listens on {} without an auth token",
            server.host
        ));
    }
}

fn validate_limits(config: &ServiceConfig, result: &mut ValidationResult) {
    let limits = &config.limits;

    if let Err(e) = limits.validate() {
        result.add_error(e.to_string());
    }

    if limits.wall_clock_timeout_seconds < limits.cpu_time_limit_seconds {
        result.add_warning(format!(
            "wall_clock_timeout_seconds ({}) is below cpu_time_limit_seconds ({}): the CPU limit can never fire",
            limits.wall_clock_timeout_seconds, limits.cpu_time_limit_seconds
        ));
    }

    if limits.network_access == NetworkAccess::Enabled {
        result.add_warning("network access is enabled for untrusted code".to_string());
    }
}

fn validate_backend(config: &ServiceConfig, result: &mut ValidationResult) {
    let backend = &config.backend;

    if !backend.work_root.is_absolute() {
        result.add_error(format!(
            "backend.work_root must be an absolute path: {}",
            backend.work_root.display()
        ));
    }

    match backend.kind {
        BackendKind::Process => {
            if backend.python_path.trim().is_empty() {
                result.add_error("backend.python_path cannot be empty".to_string());
            }
            if backend.use_cgroups && !backend.cgroup_root.is_absolute() {
                result.add_error(format!(
                    "backend.cgroup_root must be an absolute path: {}",
                    backend.cgroup_root.display()
                ));
            }
        }
        BackendKind::Docker => {
            if backend.docker_image.trim().is_empty() {
                result.add_error("backend.docker_image cannot be empty".to_string());
            }
            if backend.docker_binary.trim().is_empty() {
                result.add_error("backend.docker_binary cannot be empty".to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_default_config_is_valid() {
        let result = validate_config(&ServiceConfig::default()).unwrap();
        assert!(result.is_valid());
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_zero_slots_rejected() {
        let mut config = ServiceConfig::default();
        config.server.max_concurrent_sandboxes = 0;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("max_concurrent_sandboxes"));
    }

    #[test]
    fn test_all_errors_reported_together() {
        let mut config = ServiceConfig::default();
        config.server.port = 0;
        config.backend.work_root = PathBuf::from("relative/dir");
        config.limits.cpu_time_limit_seconds = 0;

        let message = validate_config(&config).unwrap_err().to_string();
        assert!(message.contains("server.port"));
        assert!(message.contains("work_root"));
        assert!(message.contains("cpu_time_limit_seconds"));
    }

    #[test]
    fn test_warnings_do_not_fail() {
        let mut config = ServiceConfig::default();
        config.limits.network_access = NetworkAccess::Enabled;
        config.limits.wall_clock_timeout_seconds = 2;

        let result = validate_config(&config).unwrap();
        assert!(result.is_valid());
        assert_eq!(result.warnings.len(), 2);
    }

    #[test]
    fn test_docker_requires_image() {
        let mut config = ServiceConfig::default();
        config.backend.kind = BackendKind::Docker;
        config.backend.docker_image = String::new();
        assert!(validate_config(&config).is_err());
    }
}
