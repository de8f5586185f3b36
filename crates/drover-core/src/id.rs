//! Strongly-typed identifiers for drover entities.
//!
//! All identifiers are:
//! - **Strongly typed**: Prevents mixing up different ID kinds at compile time
//! - **Lexicographically sortable**: ULIDs encode creation time and sort naturally
//! - **Globally unique**: No coordination required for generation
//!
//! # Example
//!
//! ```rust
//! use drover_core::id::{ExecutionId, OpId};
//!
//! let execution = ExecutionId::generate("daily-ingest");
//! let op = OpId::generate();
//!
//! assert!(execution.as_str().starts_with("daily-ingest-"));
//! assert_eq!(op.to_string().len(), 26);
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// A unique identifier for one execution of a data job.
///
/// Execution IDs double as the cluster object name of the one-shot job that
/// carries the execution, so system-assigned IDs are lowercase and
/// DNS-label-safe. Callers may also supply their own IDs (e.g. when an
/// upstream trigger already minted one).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(String);

impl ExecutionId {
    /// Generates a new execution ID for the given job.
    ///
    /// The ID is `<job-name>-<ulid>`, lowercased so it is usable verbatim as
    /// a cluster object name.
    #[must_use]
    pub fn generate(job_name: &str) -> Self {
        Self(format!(
            "{job_name}-{}",
            Ulid::new().to_string().to_lowercase()
        ))
    }

    /// Wraps a caller-assigned execution ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the ID is blank.
    ///
    /// Blank IDs occur when a cluster object carries no execution identity;
    /// callers treat such records as unidentifiable and skip them.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ExecutionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ExecutionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A correlation identifier for one logical operation.
///
/// Op IDs tie together the records, log lines, and cluster objects produced
/// by a single user-visible action (a deployment, an execution start, a
/// cancellation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpId(Ulid);

impl OpId {
    /// Generates a new unique op ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates an op ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for OpId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Ulid::from_str(s)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_id_embeds_job_name() {
        let id = ExecutionId::generate("hourly-export");
        assert!(id.as_str().starts_with("hourly-export-"));
        assert_eq!(id.as_str(), id.as_str().to_lowercase());
    }

    #[test]
    fn execution_ids_are_unique() {
        let a = ExecutionId::generate("job");
        let b = ExecutionId::generate("job");
        assert_ne!(a, b);
    }

    #[test]
    fn blank_execution_id_detected() {
        assert!(ExecutionId::new("  ").is_blank());
        assert!(ExecutionId::new("").is_blank());
        assert!(!ExecutionId::new("job-1").is_blank());
    }

    #[test]
    fn execution_id_serializes_transparently() {
        let id = ExecutionId::new("job-01hq");
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, "\"job-01hq\"");
    }

    #[test]
    fn op_id_round_trips_through_display() {
        let op = OpId::generate();
        let parsed: OpId = op.to_string().parse().expect("parse");
        assert_eq!(op, parsed);
    }
}
