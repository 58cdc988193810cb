//! Judge adapters.
//!
//! Core runtime stays language-agnostic. Adapters supply the harness that
//! runs test cases against a submission and the command that starts it.

pub mod adapter;
pub mod languages;
pub mod registry;

pub use adapter::{new_record_marker, JudgeAdapter};
pub use registry::adapter_for;
