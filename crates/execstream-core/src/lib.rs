//! Execstream Core - Execution Event Model
//!
//! This crate provides the shared building blocks of the execution event
//! pipeline:
//! - Execution: Lifecycle data model for tests, executions, cases and logs
//! - Event: Execution event types and their wire representation
//! - Broker: Topic-keyed publish/subscribe fan-out
//! - Repository: Persistence contract consumed by the pipeline
//! - Memory: In-memory repository that emits change notifications

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod broker;
pub mod error;
pub mod event;
pub mod execution;
pub mod memory;
pub mod metrics;
pub mod repository;

pub use broker::{Broker, BrokerConfig, BrokerError, Unsubscribe};
pub use error::{Error, Result};
pub use event::{DataType, EventData, EventType, ExecutionEvent, WireEvent, WireEventData};
pub use memory::MemoryRepository;
pub use metrics::Counter;
pub use repository::{
    CaseExecutionReadWriter, CaseExecutionReader, CaseExecutionWriter, LogReadWriter, LogReader,
    LogWriter, Repository, ResetRollback, TestExecutionListFilter, TestExecutionReadWriter,
    TestExecutionReader, TestExecutionWriter, TestReadWriter, TestReader, TestWriter,
};
pub use execution::{
    CaseExecution, CaseExecutionId, ExecutionLog, ExecutionState, FinishedCaseExecution,
    FinishedTestExecution, Payload, ResetTestExecution, ScheduledCaseExecution,
    ScheduledTestExecution, StartedCaseExecution, StartedTestExecution, Test, TestDefinition, TestExecution,
    TestExecutionId,
};
