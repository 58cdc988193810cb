//! Observability
//!
//! Audit trail for sandbox lifecycle events and Prometheus-style metrics.

pub mod audit;
pub mod metrics;
