use crate::client::{self, BatchOptions};
use crate::config::config::{BackendKind, ServiceConfig, DEFAULT_PORT};
use crate::config::validator::validate_config;
use crate::core::backend::create_backend;
use crate::observability::audit;
use crate::server::{self, EvaluationRequest, Evaluator};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve POST /evaluate over HTTP
    Serve {
        /// JSON configuration file
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Isolation backend (process or docker)
        #[arg(long)]
        backend: Option<BackendKind>,
        /// Size of the sandbox pool
        #[arg(long)]
        max_concurrent: Option<usize>,
        /// Requests allowed to wait for a sandbox
        #[arg(long)]
        max_queue: Option<usize>,
    },
    /// Evaluate one request file locally and print the evaluation
    Run {
        /// JSON file with {submission, test_cases}
        #[arg(long)]
        request: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Evaluate a JSONL file of solutions against a running server
    Batch {
        /// JSONL file, one {task_id, solution} per line
        #[arg(long)]
        input: PathBuf,
        /// Directory holding <task_id>/tests.json
        #[arg(long)]
        tests_dir: PathBuf,
        /// Per-task results (JSONL)
        #[arg(long)]
        results: PathBuf,
        /// Batch totals (JSON)
        #[arg(long)]
        summary: PathBuf,
        #[arg(long, default_value_t = format!("http://127.0.0.1:{}", DEFAULT_PORT))]
        server: String,
        /// Requests in flight at once
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
        #[arg(long, env = "TESTBOX_AUTH_TOKEN", hide_env_values = true)]
        token: Option<String>,
        /// Per-request timeout in seconds
        #[arg(long, default_value_t = 120)]
        timeout: u64,
    },
    /// Check the interpreter and the isolation primitives on this host
    CheckDeps {
        /// Verbose output showing detailed version information
        #[arg(long)]
        verbose: bool,
    },
}

pub fn run() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            host,
            port,
            backend,
            max_concurrent,
            max_queue,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(kind) = backend {
                config.backend.kind = kind;
            }
            if let Some(max) = max_concurrent {
                config.server.max_concurrent_sandboxes = max;
            }
            if let Some(max) = max_queue {
                config.server.max_queue_depth = max;
            }
            serve(config)
        }
        Commands::Run { request, config } => {
            let config = load_config(config.as_deref())?;
            evaluate_file(&config, &request)
        }
        Commands::Batch {
            input,
            tests_dir,
            results,
            summary,
            server,
            concurrency,
            token,
            timeout,
        } => {
            let options = BatchOptions {
                input,
                tests_dir,
                results,
                summary,
                server_url: server,
                concurrency,
                auth_token: token.filter(|t| !t.is_empty()),
                timeout: Duration::from_secs(timeout),
            };
            let runtime = tokio::runtime::Runtime::new()?;
            let summary = runtime.block_on(client::run_batch(&options))?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Commands::CheckDeps { verbose } => check_dependencies(verbose),
    }
}

fn load_config(path: Option<&Path>) -> Result<ServiceConfig> {
    let config = ServiceConfig::load(path)?;
    audit::init_audit_log(config.backend.audit_log.as_deref())
        .context("Failed to open audit log")?;
    Ok(config)
}

fn serve(config: ServiceConfig) -> Result<()> {
    validate_config(&config)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(server::serve(&config))?;
    Ok(())
}

fn evaluate_file(config: &ServiceConfig, request_path: &Path) -> Result<()> {
    validate_config(config)?;
    let content = std::fs::read_to_string(request_path)
        .with_context(|| format!("Failed to read request {}", request_path.display()))?;
    let request: EvaluationRequest = serde_json::from_str(&content)
        .with_context(|| format!("Invalid request in {}", request_path.display()))?;

    let backend = create_backend(&config.backend, 1)?;
    let evaluator = Evaluator::new(backend, config.limits.clone(), &config.server);
    let request_id = uuid::Uuid::new_v4().to_string();
    let evaluation = evaluator.evaluate(&request, &request_id, &AtomicBool::new(false))?;

    println!("{}", serde_json::to_string_pretty(&evaluation)?);
    Ok(())
}

/// First line of `program version_arg`, or None when it cannot run
fn probe_version(program: &str, version_arg: &str) -> Option<String> {
    let output = std::process::Command::new(program)
        .arg(version_arg)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = if output.stdout.is_empty() {
        String::from_utf8_lossy(&output.stderr).into_owned()
    } else {
        String::from_utf8_lossy(&output.stdout).into_owned()
    };
    Some(text.lines().next().unwrap_or("").trim().to_string())
}

fn check_dependencies(verbose: bool) -> Result<()> {
    use crate::kernel::{cgroup::backend::detect_cgroup_v2, namespace};

    println!("🔍 Checking testbox dependencies...");
    println!();

    let python = probe_version("python3", "--version");
    let docker = probe_version("docker", "--version");
    let cgroup_v2 = detect_cgroup_v2();
    let netns = namespace::probe_network_isolation("python3");

    let report = |name: &str, ok: bool, required: bool, detail: Option<&str>| {
        let mark = match (ok, required) {
            (true, _) => "✅",
            (false, true) => "❌",
            (false, false) => "⚠️ ",
        };
        println!("{} {} - {}", mark, name, if ok { "OK" } else { "MISSING" });
        if verbose {
            if let Some(detail) = detail {
                println!("  {}", detail);
            }
        }
    };

    report("Python 3", python.is_some(), true, python.as_deref());
    report("Docker (docker backend)", docker.is_some(), false, docker.as_deref());
    report(
        "cgroup v2 (memory accounting, OOM evidence)",
        cgroup_v2,
        false,
        Some("/sys/fs/cgroup/cgroup.controllers"),
    );
    report(
        "Network namespaces (process backend network isolation)",
        netns,
        false,
        Some(if namespace::running_as_root() {
            "CLONE_NEWNET"
        } else {
            "CLONE_NEWUSER | CLONE_NEWNET"
        }),
    );
    println!();

    if python.is_none() {
        println!("❌ python3 is required by the process backend");
        println!("  • Python: sudo apt install python3");
        std::process::exit(1);
    }
    if !cgroup_v2 || !netns {
        println!("⚠️  Some controls are unavailable; sandboxes will run degraded unless strict_mode is set");
    } else {
        println!("🎉 All isolation primitives are available");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_flags() {
        let cli = Cli::try_parse_from([
            "testbox",
            "serve",
            "--port",
            "9000",
            "--backend",
            "docker",
            "--max-concurrent",
            "8",
        ])
        .unwrap();
        match cli.command {
            Commands::Serve {
                port,
                backend,
                max_concurrent,
                ..
            } => {
                assert_eq!(port, Some(9000));
                assert_eq!(backend, Some(BackendKind::Docker));
                assert_eq!(max_concurrent, Some(8));
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_batch_defaults() {
        let cli = Cli::try_parse_from([
            "testbox",
            "batch",
            "--input",
            "in.jsonl",
            "--tests-dir",
            "tests",
            "--results",
            "out.jsonl",
            "--summary",
            "summary.json",
        ])
        .unwrap();
        match cli.command {
            Commands::Batch {
                server,
                concurrency,
                ..
            } => {
                assert_eq!(server, "http://127.0.0.1:8666");
                assert_eq!(concurrency, 4);
            }
            _ => panic!("expected batch"),
        }
    }

    #[test]
    fn test_probe_version_missing_program() {
        assert!(probe_version("testbox-no-such-program", "--version").is_none());
    }
}
