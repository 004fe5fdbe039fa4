//! Execution - Lifecycle data model
//!
//! Tests are registered by runners; each run of a test is a test execution,
//! which in turn owns numbered case executions and an append-only log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Identifier of a test execution; also the fan-out topic for its events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestExecutionId(Uuid);

impl TestExecutionId {
    /// Generate a new random identifier
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID
    #[must_use]
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// The underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Whether this is the nil UUID (never a valid topic)
    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for TestExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TestExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TestExecutionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for TestExecutionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Sequence number of a case execution, scoped to its test execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaseExecutionId(i32);

impl CaseExecutionId {
    /// Wrap a raw sequence number
    #[must_use]
    pub const fn new(seq: i32) -> Self {
        Self(seq)
    }

    /// The raw sequence number
    #[must_use]
    pub const fn get(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for CaseExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle state shared by test and case executions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ExecutionState {
    /// Waiting to be picked up
    Scheduled,
    /// Running
    Started,
    /// Done; `failed` is set when an error message was recorded
    Finished {
        /// Whether the execution finished with an error
        failed: bool,
    },
}

impl ExecutionState {
    fn derive(
        start_time: Option<DateTime<Utc>>,
        finish_time: Option<DateTime<Utc>>,
        error: Option<&str>,
    ) -> Self {
        match (start_time, finish_time) {
            (_, Some(_)) => Self::Finished {
                failed: error.is_some(),
            },
            (Some(_), None) => Self::Started,
            (None, None) => Self::Scheduled,
        }
    }

    /// Check if the state is terminal
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished { .. })
    }

    /// Returns the string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Started => "started",
            Self::Finished { failed: false } => "finished",
            Self::Finished { failed: true } => "failed",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered test, unique by (group, name)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Test {
    /// Generated identifier
    pub id: Uuid,
    /// Group the test belongs to
    pub group: String,
    /// Test name, unique within its group
    pub name: String,
    /// Whether the test accepts an input payload
    pub has_input: bool,
    /// Runner that last registered the test
    pub runner_id: String,
    /// Last heartbeat of that runner
    pub runner_heartbeat_at: DateTime<Utc>,
    /// When the test was (re-)registered
    pub create_time: DateTime<Utc>,
}

/// Upsert input for a test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestDefinition {
    /// Group the test belongs to
    pub group: String,
    /// Test name
    pub name: String,
    /// Whether the test accepts an input payload
    pub has_input: bool,
    /// Registering runner
    pub runner_id: String,
}

impl TestDefinition {
    /// Create a definition without input
    #[must_use]
    pub fn new(
        group: impl Into<String>,
        name: impl Into<String>,
        runner_id: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
            has_input: false,
            runner_id: runner_id.into(),
        }
    }

    /// Mark the test as accepting input
    #[must_use]
    pub fn with_input(mut self) -> Self {
        self.has_input = true;
        self
    }
}

/// One run of a test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestExecution {
    /// Generated identifier
    pub id: TestExecutionId,
    /// Test being executed
    pub test_id: Uuid,
    /// Whether an input payload was supplied
    pub has_input: bool,
    /// When the execution was (re-)scheduled
    pub schedule_time: DateTime<Utc>,
    /// When a runner started it
    pub start_time: Option<DateTime<Utc>>,
    /// When it finished
    pub finish_time: Option<DateTime<Utc>>,
    /// Failure message, if it finished with an error
    pub error: Option<String>,
}

impl TestExecution {
    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ExecutionState {
        ExecutionState::derive(self.start_time, self.finish_time, self.error.as_deref())
    }

    /// Move to `Started`
    pub fn start(&mut self, at: DateTime<Utc>) -> Result<()> {
        self.timeline().start(at)
    }

    /// Move to `Finished`, recording an error message on failure
    pub fn finish(&mut self, at: DateTime<Utc>, error: Option<String>) -> Result<()> {
        self.timeline().finish(at, error)
    }

    /// Restore `Scheduled` from any state
    pub fn reset(&mut self, at: DateTime<Utc>) {
        self.timeline().reset(at);
    }

    fn timeline(&mut self) -> Timeline<'_> {
        Timeline {
            entity: "test execution",
            schedule_time: &mut self.schedule_time,
            start_time: &mut self.start_time,
            finish_time: &mut self.finish_time,
            error: &mut self.error,
        }
    }
}

/// One case inside a test execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseExecution {
    /// Sequence number within the owning test execution
    pub id: CaseExecutionId,
    /// Owning test execution
    pub test_execution_id: TestExecutionId,
    /// Case name as reported by the runner
    pub case_name: String,
    /// When the case was scheduled
    pub schedule_time: DateTime<Utc>,
    /// When it started
    pub start_time: Option<DateTime<Utc>>,
    /// When it finished
    pub finish_time: Option<DateTime<Utc>>,
    /// Failure message
    pub error: Option<String>,
}

impl CaseExecution {
    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ExecutionState {
        ExecutionState::derive(self.start_time, self.finish_time, self.error.as_deref())
    }

    /// Move to `Started`
    pub fn start(&mut self, at: DateTime<Utc>) -> Result<()> {
        self.timeline().start(at)
    }

    /// Move to `Finished`
    pub fn finish(&mut self, at: DateTime<Utc>, error: Option<String>) -> Result<()> {
        self.timeline().finish(at, error)
    }

    /// Restore `Scheduled` from any state
    pub fn reset(&mut self, at: DateTime<Utc>) {
        self.timeline().reset(at);
    }

    fn timeline(&mut self) -> Timeline<'_> {
        Timeline {
            entity: "case execution",
            schedule_time: &mut self.schedule_time,
            start_time: &mut self.start_time,
            finish_time: &mut self.finish_time,
            error: &mut self.error,
        }
    }
}

/// Timestamps shared by test and case executions, borrowed for one transition
struct Timeline<'a> {
    entity: &'static str,
    schedule_time: &'a mut DateTime<Utc>,
    start_time: &'a mut Option<DateTime<Utc>>,
    finish_time: &'a mut Option<DateTime<Utc>>,
    error: &'a mut Option<String>,
}

impl Timeline<'_> {
    fn start(self, at: DateTime<Utc>) -> Result<()> {
        self.ensure_not_finished("start")?;
        *self.start_time = Some(at);
        Ok(())
    }

    fn finish(self, at: DateTime<Utc>, error: Option<String>) -> Result<()> {
        self.ensure_not_finished("finish")?;
        *self.finish_time = Some(at);
        *self.error = error;
        Ok(())
    }

    fn reset(self, at: DateTime<Utc>) {
        *self.schedule_time = at;
        *self.start_time = None;
        *self.finish_time = None;
        *self.error = None;
    }

    fn ensure_not_finished(&self, action: &'static str) -> Result<()> {
        let state =
            ExecutionState::derive(*self.start_time, *self.finish_time, self.error.as_deref());
        if state.is_terminal() {
            return Err(Error::InvalidTransition {
                entity: self.entity,
                action,
                state: state.to_string(),
            });
        }
        Ok(())
    }
}

/// Opaque input payload of a test (its default) or of one test execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Encoded input, interpreted only by the runner
    pub data: Vec<u8>,
}

impl Payload {
    /// Wrap encoded input
    #[must_use]
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }

    /// The encoded input
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// A log line emitted during a test execution (append-only)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLog {
    /// Generated identifier
    pub id: Uuid,
    /// Owning test execution
    pub test_execution_id: TestExecutionId,
    /// Case the log was emitted in, if any
    pub case_execution_id: Option<CaseExecutionId>,
    /// Severity (INFO, WARN, ...)
    pub level: String,
    /// Log text
    pub message: String,
    /// When the runner emitted it
    pub create_time: DateTime<Utc>,
}

impl ExecutionLog {
    /// Create a test-level log line stamped now
    #[must_use]
    pub fn new(
        test_execution_id: TestExecutionId,
        level: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            test_execution_id,
            case_execution_id: None,
            level: level.into(),
            message: message.into(),
            create_time: Utc::now(),
        }
    }

    /// Attach the log to a case execution
    #[must_use]
    pub fn for_case(mut self, case_execution_id: CaseExecutionId) -> Self {
        self.case_execution_id = Some(case_execution_id);
        self
    }
}

/// Input for scheduling a test execution
#[derive(Debug, Clone)]
pub struct ScheduledTestExecution {
    /// Identifier to use (callers pre-generate it to dispatch work)
    pub id: TestExecutionId,
    /// Test being executed
    pub test_id: Uuid,
    /// Whether an input payload was supplied
    pub has_input: bool,
    /// Schedule time
    pub schedule_time: DateTime<Utc>,
}

/// Input for marking a test execution started
#[derive(Debug, Clone)]
pub struct StartedTestExecution {
    /// Execution to update
    pub id: TestExecutionId,
    /// Start time
    pub start_time: DateTime<Utc>,
}

/// Input for marking a test execution finished
#[derive(Debug, Clone)]
pub struct FinishedTestExecution {
    /// Execution to update
    pub id: TestExecutionId,
    /// Finish time
    pub finish_time: DateTime<Utc>,
    /// Failure message
    pub error: Option<String>,
}

/// Input for resetting a test execution back to `Scheduled`
#[derive(Debug, Clone)]
pub struct ResetTestExecution {
    /// Execution to reset
    pub id: TestExecutionId,
    /// New schedule time
    pub reset_time: DateTime<Utc>,
}

/// Input for scheduling a case execution
#[derive(Debug, Clone)]
pub struct ScheduledCaseExecution {
    /// Owning test execution
    pub test_execution_id: TestExecutionId,
    /// Case name
    pub case_name: String,
    /// Schedule time
    pub schedule_time: DateTime<Utc>,
}

/// Input for marking a case execution started
#[derive(Debug, Clone)]
pub struct StartedCaseExecution {
    /// Case to update
    pub id: CaseExecutionId,
    /// Owning test execution
    pub test_execution_id: TestExecutionId,
    /// Start time
    pub start_time: DateTime<Utc>,
}

/// Input for marking a case execution finished
#[derive(Debug, Clone)]
pub struct FinishedCaseExecution {
    /// Case to update
    pub id: CaseExecutionId,
    /// Owning test execution
    pub test_execution_id: TestExecutionId,
    /// Finish time
    pub finish_time: DateTime<Utc>,
    /// Failure message
    pub error: Option<String>,
}
