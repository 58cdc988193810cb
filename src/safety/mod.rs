//! Safety and cleanup
//!
//! Run-scoped workspaces and symlink-safe removal.

pub mod safe_cleanup;
pub mod workspace;
