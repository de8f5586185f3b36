//! # drover-core
//!
//! Core abstractions for the drover data-job control plane.
//!
//! This crate provides the foundational types used across all drover
//! components:
//!
//! - **Identifiers**: Strongly-typed IDs for executions and operations
//! - **Observability**: Structured logging initialization and span helpers
//!
//! ## Crate Boundary
//!
//! `drover-core` is the only crate allowed to define shared primitives.
//! Domain logic (reconciliation, templates, persistence rules) lives in
//! `drover-exec`.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod id;
pub mod observability;

pub use id::{ExecutionId, OpId};

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use drover_core::prelude::*;
///
/// let id = ExecutionId::generate("daily-ingest");
/// assert!(id.as_str().starts_with("daily-ingest-"));
/// ```
pub mod prelude {
    pub use crate::id::{ExecutionId, OpId};
    pub use crate::observability::{init_logging, LogFormat};
}
