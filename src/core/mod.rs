//! Language-agnostic sandbox core.
//!
//! Backends create and destroy isolation boundaries; the handle owns what
//! sits inside one. Language-specific harness generation lives in judge
//! adapters.

pub mod backend;
pub mod docker;
pub mod handle;
pub mod process;

pub use backend::{create_backend, ExitEvidence, IsolationBackend, LaunchedPayload, RuntimeView};
pub use handle::SandboxHandle;
