//! Evidence-backed verdict classification
//!
//! Run-level status and per-test verdicts, both derived as pure functions
//! over what a run left behind.

pub mod classifier;
pub mod interpreter;

pub use classifier::{RunEvidence, VerdictClassifier};
pub use interpreter::{interpret, statistics};
