/// Service configuration loading from a JSON file plus environment overrides
use crate::config::types::{ResourceLimits, Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_PORT: u16 = 8666;

/// Isolation backend selector
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Process group + rlimits + optional namespaces and cgroup v2
    #[serde(rename = "process")]
    #[default]
    Process,
    /// One docker container per sandbox
    #[serde(rename = "docker")]
    Docker,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Process => "process",
            BackendKind::Docker => "docker",
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = SandboxError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "process" => Ok(BackendKind::Process),
            "docker" | "container" => Ok(BackendKind::Docker),
            other => Err(SandboxError::Config(format!(
                "unknown backend '{}', expected process or docker",
                other
            ))),
        }
    }
}

/// HTTP front end and admission control
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    /// Fixed size of the sandbox slot pool
    pub max_concurrent_sandboxes: usize,
    /// Requests allowed to wait for a slot before ServiceBusy
    pub max_queue_depth: usize,
    /// Retries of `acquire` on ResourceExhausted
    pub acquire_retries: u32,
    /// Base delay for exponential acquire backoff
    pub retry_backoff_ms: u64,
    /// Static bearer token; requests are unauthenticated when unset
    pub auth_token: Option<String>,
    /// Largest accepted request body
    pub max_request_bytes: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            max_concurrent_sandboxes: 4,
            max_queue_depth: 64,
            acquire_retries: 3,
            retry_backoff_ms: 50,
            auth_token: None,
            max_request_bytes: 8 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendSection {
    pub kind: BackendKind,
    /// Parent directory of per-run workspaces
    pub work_root: PathBuf,
    pub python_path: String,
    pub docker_binary: String,
    pub docker_image: String,
    /// Create a cgroup v2 leaf per sandbox when the hierarchy is writable
    pub use_cgroups: bool,
    pub cgroup_root: PathBuf,
    /// Fail launches instead of degrading when a control cannot be applied
    pub strict_mode: bool,
    /// Workspaces older than this are swept at startup
    pub stale_workspace_secs: u64,
    /// Optional JSON-lines audit file in addition to the log stream
    pub audit_log: Option<PathBuf>,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            kind: BackendKind::Process,
            work_root: std::env::temp_dir().join("testbox"),
            python_path: "python3".to_string(),
            docker_binary: "docker".to_string(),
            docker_image: "python:3.12-slim".to_string(),
            use_cgroups: true,
            cgroup_root: PathBuf::from("/sys/fs/cgroup/testbox"),
            strict_mode: false,
            stale_workspace_secs: 3600,
            audit_log: None,
        }
    }
}

/// Full service configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ServiceConfig {
    pub server: ServerSection,
    pub limits: ResourceLimits,
    pub backend: BackendSection,
}

impl ServiceConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SandboxError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        serde_json::from_str(&content)
            .map_err(|e| SandboxError::Config(format!("Failed to parse config JSON: {}", e)))
    }

    /// File if given, defaults otherwise, then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `SERVER_HOST`, `SERVER_PORT`, `TESTBOX_BACKEND`, `TESTBOX_WORK_ROOT`
    /// and `TESTBOX_AUTH_TOKEN`
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("SERVER_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("SERVER_PORT") {
            self.server.port = port.trim().parse().map_err(|_| {
                SandboxError::Config(format!("SERVER_PORT is not a valid port: {}", port))
            })?;
        }
        if let Some(kind) = lookup("TESTBOX_BACKEND") {
            self.backend.kind = kind.parse()?;
        }
        if let Some(root) = lookup("TESTBOX_WORK_ROOT") {
            self.backend.work_root = PathBuf::from(root);
        }
        if let Some(token) = lookup("TESTBOX_AUTH_TOKEN") {
            self.server.auth_token = if token.is_empty() { None } else { Some(token) };
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.server.port, 8666);
        assert_eq!(config.server.max_concurrent_sandboxes, 4);
        assert_eq!(config.backend.kind, BackendKind::Process);
        assert_eq!(config.bind_address(), "127.0.0.1:8666");
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("testbox.json");
        std::fs::write(
            &path,
            r#"{"server": {"port": 9000}, "limits": {"wall_clock_timeout_seconds": 2}, "backend": {"kind": "docker"}}"#,
        )
        .unwrap();

        let config = ServiceConfig::load_from_file(&path).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.max_queue_depth, 64);
        assert_eq!(config.limits.wall_clock_timeout_seconds, 2);
        assert_eq!(config.limits.cpu_time_limit_seconds, 10);
        assert_eq!(config.backend.kind, BackendKind::Docker);
    }

    #[test]
    fn test_load_rejects_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            ServiceConfig::load_from_file(&path),
            Err(SandboxError::Config(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("SERVER_PORT", "9100"),
            ("TESTBOX_BACKEND", "docker"),
            ("TESTBOX_AUTH_TOKEN", "secret"),
        ]
        .into_iter()
        .collect();

        let mut config = ServiceConfig::default();
        config
            .apply_env_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.backend.kind, BackendKind::Docker);
        assert_eq!(config.server.auth_token.as_deref(), Some("secret"));
    }

    #[test]
    fn test_env_override_rejects_bad_port() {
        let mut config = ServiceConfig::default();
        let result = config.apply_env_overrides(|key| {
            (key == "SERVER_PORT").then(|| "eighty".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("Docker".parse::<BackendKind>().unwrap(), BackendKind::Docker);
        assert_eq!("process".parse::<BackendKind>().unwrap(), BackendKind::Process);
        assert!("vm".parse::<BackendKind>().is_err());
    }
}
