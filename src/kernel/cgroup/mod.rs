//! Cgroup resource governance
//!
//! cgroup v2 leaves per sandbox, used when the hierarchy is writable.

pub mod backend;
pub mod v2;

pub use backend::{CgroupBackend, CgroupEvidence};
pub use v2::CgroupV2;
