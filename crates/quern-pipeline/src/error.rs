//! Error types for the pipeline engine.

use quern_core::NodeId;
use quern_core::NodeState;

/// The result type used throughout quern-pipeline.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in engine operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A state store operation failed.
    #[error("store error: {message}")]
    Store {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A node was not found in the state store.
    #[error("node not found: {id}")]
    NodeNotFound {
        /// The node id that was looked up.
        id: NodeId,
    },

    /// A compare-and-swap write lost to a concurrent transition.
    #[error("state precondition failed for {id}: expected {expected}, found {actual}")]
    StateMismatch {
        /// The node id.
        id: NodeId,
        /// The state the writer expected.
        expected: NodeState,
        /// The state the store actually held.
        actual: NodeState,
    },

    /// A child was submitted under a parent that no longer accepts
    /// children.
    #[error("parent {parent} is {state} and rejects new children")]
    ParentClosed {
        /// The parent node id.
        parent: NodeId,
        /// The parent's current state.
        state: NodeState,
    },

    /// An event bus operation failed.
    #[error("event bus error: {message}")]
    Bus {
        /// Description of the failure.
        message: String,
    },

    /// A blob store operation failed.
    #[error("blob store error: {message}")]
    Blob {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A runtime rejected or failed a job submission.
    #[error("runtime '{runtime}' submission failed: {message}")]
    Submission {
        /// The runtime name.
        runtime: String,
        /// Description of the failure.
        message: String,
    },

    /// A job template could not be rendered.
    #[error("job render failed for '{job}': {message}")]
    Render {
        /// The job name.
        job: String,
        /// Description of the failure.
        message: String,
    },

    /// An inbound payload was malformed and permanently rejected.
    #[error("payload rejected: {message}")]
    PayloadRejected {
        /// Description of what made the payload invalid.
        message: String,
    },

    /// A source tree operation failed.
    #[error("source tree error for '{tree}': {message}")]
    SourceTree {
        /// The tree name.
        tree: String,
        /// Description of the failure.
        message: String,
    },

    /// The downstream reporting sink rejected a submission.
    #[error("reporting sink error: {message}")]
    Reporting {
        /// Description of the failure.
        message: String,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the failure.
        message: String,
    },

    /// An error from quern-core.
    #[error(transparent)]
    Core(#[from] quern_core::Error),
}

impl Error {
    /// Creates a new store error.
    #[must_use]
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new store error with a source cause.
    #[must_use]
    pub fn store_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Store {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new blob store error.
    #[must_use]
    pub fn blob(message: impl Into<String>) -> Self {
        Self::Blob {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new event bus error.
    #[must_use]
    pub fn bus(message: impl Into<String>) -> Self {
        Self::Bus {
            message: message.into(),
        }
    }

    /// Creates a new submission error.
    #[must_use]
    pub fn submission(runtime: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Submission {
            runtime: runtime.into(),
            message: message.into(),
        }
    }

    /// Creates a new payload rejection error.
    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::PayloadRejected {
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

    /// Returns true if the error is transient and the operation should be
    /// retried with backoff rather than surfaced to a node.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store { .. } | Self::Bus { .. } | Self::Blob { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_mismatch_display() {
        let err = Error::StateMismatch {
            id: NodeId::new("n1"),
            expected: NodeState::Available,
            actual: NodeState::Closing,
        };
        let msg = err.to_string();
        assert!(msg.contains("available"));
        assert!(msg.contains("closing"));
    }

    #[test]
    fn transient_classification() {
        assert!(Error::store("connection reset").is_transient());
        assert!(Error::bus("disconnected").is_transient());
        assert!(!Error::rejected("bad json").is_transient());
        assert!(!Error::submission("lava", "boom").is_transient());
    }
}
