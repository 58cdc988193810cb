//! Utilities
//!
//! Bounded output collection.

pub mod output;
