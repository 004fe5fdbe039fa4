//! Error types for execstream-postgres

use execstream_core::BrokerError;
use thiserror::Error;

/// Failure while waiting for the next change notification
#[derive(Debug, Error)]
pub enum ListenError {
    /// The wait was cancelled; callers stop iterating
    #[error("listener cancelled")]
    Cancelled,

    /// A single notification payload could not be decoded
    #[error("malformed notification payload: {0}")]
    Decode(String),

    /// The notification connection is gone
    #[error("notification connection lost")]
    ConnectionLost,

    /// Database error on the notification connection
    #[error("database error: {0}")]
    Database(String),
}

impl ListenError {
    /// Whether the listener can no longer be used
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConnectionLost | Self::Database(_))
    }
}

/// Failure translating an envelope into an event
#[derive(Debug, Error)]
pub enum TranslateError {
    /// The row body did not match the table's row shape
    #[error("failed to decode {table} row: {message}")]
    Row {
        /// Source table
        table: String,
        /// Decoder message
        message: String,
    },
}

/// Error reported by an event source
#[derive(Debug, Error)]
pub enum SourceError {
    /// Listener failure
    #[error(transparent)]
    Listen(#[from] ListenError),

    /// Translation failure
    #[error(transparent)]
    Translate(#[from] TranslateError),

    /// Broker failure
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// `start` called more than once
    #[error("event source already started")]
    AlreadyStarted,

    /// `start` called after `stop`
    #[error("event source stopped")]
    Stopped,
}

impl SourceError {
    /// Whether the dispatch loop ended because of this error
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Listen(e) => e.is_fatal(),
            Self::Broker(_) => true,
            Self::Translate(_) | Self::AlreadyStarted | Self::Stopped => false,
        }
    }
}
