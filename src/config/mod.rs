//! Configuration
//!
//! Shared types, service configuration loading and startup validation.

#[allow(clippy::module_inception)]
pub mod config;
pub mod types;
pub mod validator;
