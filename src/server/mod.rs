//! Request server
//!
//! Slot pool with a bounded queue, the blocking evaluation service and the
//! axum HTTP front end.

pub mod http;
pub mod pool;
pub mod service;

pub use http::{build_router, serve, AppState};
pub use pool::{PoolPermit, SandboxPool};
pub use service::{Evaluation, EvaluationRequest, Evaluator};
