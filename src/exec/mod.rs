//! Execution control
//!
//! The driver runs one submission per sandbox; the pre-exec plan applies
//! limits inside the child before the interpreter starts.

pub mod driver;
pub mod preexec;

pub use driver::{ExecutionDriver, TIMEOUT_EXIT_CODE};
