//! Shared types for the Orbit workspace.
//!
//! Keep cross-crate specs, runtime records, and status enums here to avoid duplication.

#![warn(missing_docs)]

/// Shared API DTOs for cross-crate use.
pub mod api;
