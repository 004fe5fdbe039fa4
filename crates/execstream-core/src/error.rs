//! Error types for execstream-core

use thiserror::Error;

use crate::broker::BrokerError;

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    /// Entity not found
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind (test, test execution, case execution, log)
        entity: &'static str,
        /// Identifier that was looked up
        id: String,
    },

    /// Lifecycle transition not allowed from the current state
    #[error("invalid transition: cannot {action} {entity} in state {state}")]
    InvalidTransition {
        /// Entity kind
        entity: &'static str,
        /// Attempted transition
        action: &'static str,
        /// State the entity was in
        state: String,
    },

    /// Broker misuse (publish before start, publish after stop, double start)
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a [`Error::NotFound`]
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
