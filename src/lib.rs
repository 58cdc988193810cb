//! testbox: sandboxed evaluation of untrusted Python submissions
//! against unit tests.
//!
//! # Architecture
//!
//! A request flows through four components:
//!
//! ## Isolation Backend ([`core`])
//! - [`core::backend`]: the `IsolationBackend` trait and backend selection
//! - [`core::process`]: process group + rlimits + namespaces + cgroup v2
//! - [`core::docker`]: one container per sandbox
//! - [`core::handle`]: `SandboxHandle`, the ownership token for one sandbox
//!
//! ## Execution Driver ([`exec`])
//! - [`exec::driver`]: writes the workspace, launches the harness, enforces
//!   the wall clock and collects evidence
//! - [`exec::preexec`]: rlimits and namespaces applied between fork and exec
//!
//! ## Result Interpreter ([`verdict`], [`judge`])
//! - [`judge`]: language adapters and the in-sandbox harness
//! - [`verdict::classifier`]: run-level status from exit evidence
//! - [`verdict::interpreter`]: one verdict per declared test
//!
//! ## Request Server ([`server`])
//! - [`server::pool`]: fixed slot pool with a bounded queue
//! - [`server::service`]: acquire, run, interpret, release
//! - [`server::http`]: axum front end
//!
//! Supporting modules: [`kernel`] (signals, namespaces, cgroups),
//! [`safety`] (workspaces, symlink-safe removal), [`observability`]
//! (audit events, metrics), [`config`], [`utils`] (bounded output) and
//! [`client`] (batch evaluation against a running server).
//!
//! # Design Principles
//!
//! 1. **Release is guaranteed** - every handle is torn down on every path
//! 2. **Kernel as truth** - verdicts come from wait status, cgroup events
//!    and the judge's own actions, never from the submission's say-so
//! 3. **Contain per-submission failures** - crashes become verdicts,
//!    only missing capacity becomes an error

// Kernel Primitives
pub mod kernel;

// Execution Control
pub mod exec;

// Sandbox lifecycle and isolation backends
pub mod core;

// Language adapters and harnesses
pub mod judge;

// Run classification and verdicts
pub mod verdict;

// Workspaces and cleanup
pub mod safety;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Utilities
pub mod utils;

// HTTP server and evaluation service
pub mod server;

// Batch evaluation client
pub mod client;

// CLI entrypoint for the testbox binary
pub mod cli;

// Re-export commonly used types for convenience
pub use config::types::*;
