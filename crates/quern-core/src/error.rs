//! Error types and result aliases shared across the pipeline.

use crate::node::NodeState;

/// The result type used throughout quern-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the id invalid.
        message: String,
    },

    /// An invalid node state transition was attempted.
    ///
    /// Node states only advance along `running → available → closing → done`
    /// (or directly `running → done`); anything else is rejected here.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        /// The current state.
        from: NodeState,
        /// The attempted target state.
        to: NodeState,
    },

    /// A result was assigned to a node that already holds a terminal result.
    #[error("result already final for node {node}: {result}")]
    ResultFinal {
        /// The node id.
        node: String,
        /// The existing terminal result.
        result: String,
    },

    /// A configuration file could not be read or parsed.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A rule or filter expression could not be parsed.
    #[error("invalid rule expression '{expression}': {message}")]
    InvalidRule {
        /// The offending expression.
        expression: String,
        /// Description of the parse failure.
        message: String,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },
}

impl Error {
    /// Creates a new configuration error with the given message.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new configuration error with a source cause.
    #[must_use]
    pub fn configuration_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Configuration {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new rule parse error.
    #[must_use]
    pub fn invalid_rule(expression: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidRule {
            expression: expression.into(),
            message: message.into(),
        }
    }
}
