//! Notification envelope
//!
//! Every notification carries the same outer shape regardless of table, so
//! decoding happens in two phases: the `{table, action, data}` wrapper first,
//! with `data` left as untyped JSON, and the row body only once the consumer
//! knows which row type the table holds.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ListenError, TranslateError};

/// Row mutation that produced a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    /// Row inserted
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
}

impl Action {
    /// Trigger operation name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded notification before translation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Source table
    pub table: String,
    /// Mutation kind
    pub action: Action,
    /// Row body, decoded lazily by [`Envelope::row`]
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// Build an envelope directly
    pub fn new(table: impl Into<String>, action: Action, data: Value) -> Self {
        Self {
            table: table.into(),
            action,
            data,
        }
    }

    /// Decode the outer wrapper of a notification payload
    pub fn decode(payload: &str) -> Result<Self, ListenError> {
        serde_json::from_str(payload).map_err(|e| ListenError::Decode(e.to_string()))
    }

    /// Decode the row body as `R`
    pub fn row<R: DeserializeOwned>(&self) -> Result<R, TranslateError> {
        R::deserialize(&self.data).map_err(|e| TranslateError::Row {
            table: self.table.clone(),
            message: e.to_string(),
        })
    }
}
