//! Error types for the execution reconciliation engine.
//!
//! The taxonomy separates failures by how callers must react:
//!
//! - [`Error::ClusterApi`]: transport or server-side cluster failures;
//!   transient at tick granularity, retried on the next pass
//! - [`Error::DefinitionShape`]: a template or derived object is missing
//!   required nested structure; fatal, caught by eager validation at startup
//! - [`Error::NotCancellable`]: an execution is not in a cancellable state
//!   or cannot be identified; surfaced to the caller with context
//! - [`Error::Repository`]: persistence failed after bounded retries; fatal
//!   to the single update it accompanies

use crate::model::ExecutionStatus;

/// The result type used throughout drover-exec.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in reconciliation and deployment operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A cluster API call failed.
    #[error("cluster API error: {message}")]
    ClusterApi {
        /// Description of the failure.
        message: String,
        /// Machine-readable reason reported by the cluster, if any.
        reason: Option<String>,
        /// HTTP-level status code reported by the cluster, if any.
        code: Option<u16>,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A workload template or derived object is missing required structure.
    #[error("workload definition incomplete: {message}")]
    DefinitionShape {
        /// What is missing and where.
        message: String,
    },

    /// An execution is not in a state that permits cancellation.
    #[error("execution not cancellable: {message}")]
    NotCancellable {
        /// Why the cancellation was rejected.
        message: String,
        /// The stored status at rejection time, when known.
        current_status: Option<ExecutionStatus>,
    },

    /// A persistence operation failed after exhausting its retries.
    #[error("repository error after {attempts} attempts: {message}")]
    Repository {
        /// Description of the failing operation.
        message: String,
        /// How many attempts were made.
        attempts: u32,
        /// The final underlying failure.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Invalid or missing configuration.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// A storage operation failed (single attempt, pre-retry).
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
    },
}

impl Error {
    /// Creates a new cluster API error.
    #[must_use]
    pub fn cluster_api(message: impl Into<String>) -> Self {
        Self::ClusterApi {
            message: message.into(),
            reason: None,
            code: None,
            source: None,
        }
    }

    /// Creates a cluster API error with an underlying cause.
    #[must_use]
    pub fn cluster_api_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::ClusterApi {
            message: message.into(),
            reason: None,
            code: None,
            source: Some(Box::new(source)),
        }
    }

    /// Creates a cluster API error carrying the server's status response.
    #[must_use]
    pub fn cluster_api_status(
        message: impl Into<String>,
        reason: impl Into<String>,
        code: u16,
    ) -> Self {
        Self::ClusterApi {
            message: message.into(),
            reason: Some(reason.into()),
            code: Some(code),
            source: None,
        }
    }

    /// Creates a new definition-shape error.
    #[must_use]
    pub fn definition_shape(message: impl Into<String>) -> Self {
        Self::DefinitionShape {
            message: message.into(),
        }
    }

    /// Creates a new not-cancellable error.
    #[must_use]
    pub fn not_cancellable(
        message: impl Into<String>,
        current_status: Option<ExecutionStatus>,
    ) -> Self {
        Self::NotCancellable {
            message: message.into(),
            current_status,
        }
    }

    /// Creates a new repository error.
    #[must_use]
    pub fn repository(message: impl Into<String>, attempts: u32, source: Self) -> Self {
        Self::Repository {
            message: message.into(),
            attempts,
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}
