//! Execstream Postgres - change notifications to execution events
//!
//! This crate bridges Postgres row-change notifications into the typed
//! execution event stream:
//! - Envelope: two-phase decoding of `{table, action, data}` payloads
//! - Listener: dedicated `LISTEN` connection (or an in-process channel)
//! - Translator: envelope to zero-or-one [`ExecutionEvent`]
//! - Source: listener, translator and broker wired into one dispatch loop
//! - Store: the [`Repository`] implementation and its schema
//!
//! [`ExecutionEvent`]: execstream_core::ExecutionEvent
//! [`Repository`]: execstream_core::Repository

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod envelope;
pub mod error;
pub mod listener;
pub mod rows;
pub mod schema;
pub mod source;
pub mod store;
pub mod translator;

pub use config::{connect_pool, DatabaseConfig, EventsConfig};
pub use envelope::{Action, Envelope};
pub use error::{ListenError, SourceError, TranslateError};
pub use listener::{ChangeListener, ChannelListener, PgChangeListener};
pub use rows::{CaseExecutionRow, LogRow, TestExecutionRow};
pub use schema::run_migrations;
pub use source::{EventSource, PgEventSource};
pub use store::PgRepository;
pub use translator::translate;
