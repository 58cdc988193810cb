//! Thin wrappers around Linux kernel primitives.
//!
//! `unsafe` code is concentrated here and in the pre-exec plan, with
//! explicit SAFETY comments.

pub mod cgroup;
pub mod namespace;
pub mod signal;
