//! Repository - persistence contract for tests, executions, cases and logs
//!
//! The event pipeline never writes through this contract; it only observes
//! the change notifications a backend emits for these writes. Backends are
//! expected to emit one notification per committed row mutation of test
//! executions, case executions and logs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use uuid::Uuid;

use crate::error::Result;
use crate::execution::{
    CaseExecution, CaseExecutionId, ExecutionLog, FinishedCaseExecution, FinishedTestExecution,
    Payload, ResetTestExecution, ScheduledCaseExecution, ScheduledTestExecution,
    StartedCaseExecution, StartedTestExecution, Test, TestDefinition, TestExecution,
    TestExecutionId,
};

/// Table names carried in change notifications
pub mod tables {
    /// Test execution rows
    pub const TEST_EXECUTIONS: &str = "test_executions";
    /// Case execution rows
    pub const CASE_EXECUTIONS: &str = "case_executions";
    /// Log rows
    pub const LOGS: &str = "logs";
}

/// Undo action returned alongside a committed reset
///
/// Invoke it only if the step that depends on the reset (re-dispatching the
/// execution, for instance) fails. It restores the pre-reset execution and
/// the case executions the reset removed.
pub type ResetRollback = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Keyset pagination for listing test executions (newest schedule first)
#[derive(Debug, Clone, Default)]
pub struct TestExecutionListFilter {
    /// Maximum results (all when unset)
    pub page_size: Option<usize>,
    /// Continue after this (schedule_time, id) position
    pub after: Option<(DateTime<Utc>, TestExecutionId)>,
}

impl TestExecutionListFilter {
    /// Create an unbounded filter
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the page size
    #[must_use]
    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size);
        self
    }

    /// Continue after the given execution
    #[must_use]
    pub fn after(mut self, last: &TestExecution) -> Self {
        self.after = Some((last.schedule_time, last.id));
        self
    }
}

/// Read operations for tests
#[async_trait]
pub trait TestReader: Send + Sync {
    /// Get a test by id
    async fn get_test(&self, id: Uuid) -> Result<Test>;

    /// Get a test by its unique (group, name)
    async fn get_test_by_name(&self, group: &str, name: &str) -> Result<Test>;

    /// List all tests
    async fn list_tests(&self) -> Result<Vec<Test>>;

    /// Get the input a test runs with when an execution supplies none
    async fn get_test_default_input(&self, test_id: Uuid) -> Result<Payload>;
}

/// Write operations for tests
#[async_trait]
pub trait TestWriter: Send + Sync {
    /// Upsert a test by (group, name); the runner heartbeat is refreshed
    async fn create_test(&self, definition: &TestDefinition) -> Result<Test>;

    /// Upsert several tests
    async fn create_tests(&self, definitions: &[TestDefinition]) -> Result<Vec<Test>> {
        let mut tests = Vec::with_capacity(definitions.len());
        for definition in definitions {
            tests.push(self.create_test(definition).await?);
        }
        Ok(tests)
    }

    /// Store (or replace) the default input of a test
    async fn create_test_default_input(&self, test_id: Uuid, input: &Payload) -> Result<()>;
}

/// Read operations for test executions
#[async_trait]
pub trait TestExecutionReader: Send + Sync {
    /// Get a test execution by id
    async fn get_test_execution(&self, id: TestExecutionId) -> Result<TestExecution>;

    /// Get the input supplied when the execution was scheduled
    async fn get_test_execution_input(&self, id: TestExecutionId) -> Result<Payload>;

    /// List executions of a test, newest schedule first
    async fn list_test_executions(
        &self,
        test_id: Uuid,
        filter: &TestExecutionListFilter,
    ) -> Result<Vec<TestExecution>>;
}

/// Write operations for test executions
#[async_trait]
pub trait TestExecutionWriter: Send + Sync {
    /// Create (or re-create) an execution in the `Scheduled` state
    async fn create_scheduled_test_execution(
        &self,
        scheduled: &ScheduledTestExecution,
    ) -> Result<TestExecution>;

    /// Store (or replace) the input of an execution
    async fn create_test_execution_input(
        &self,
        id: TestExecutionId,
        input: &Payload,
    ) -> Result<()>;

    /// Mark an execution started
    async fn update_started_test_execution(
        &self,
        started: &StartedTestExecution,
    ) -> Result<TestExecution>;

    /// Mark an execution finished
    async fn update_finished_test_execution(
        &self,
        finished: &FinishedTestExecution,
    ) -> Result<TestExecution>;

    /// Reset an execution to `Scheduled`, deleting its case executions.
    ///
    /// The reset is committed before this returns; the rollback undoes it.
    async fn reset_test_execution(
        &self,
        reset: &ResetTestExecution,
    ) -> Result<(TestExecution, ResetRollback)>;
}

/// Read operations for case executions
#[async_trait]
pub trait CaseExecutionReader: Send + Sync {
    /// Get a case execution
    async fn get_case_execution(
        &self,
        test_execution_id: TestExecutionId,
        id: CaseExecutionId,
    ) -> Result<CaseExecution>;

    /// List the case executions of a test execution in sequence order
    async fn list_case_executions(
        &self,
        test_execution_id: TestExecutionId,
    ) -> Result<Vec<CaseExecution>>;
}

/// Write operations for case executions
#[async_trait]
pub trait CaseExecutionWriter: Send + Sync {
    /// Schedule a case; its sequence number is assigned here
    async fn create_scheduled_case_execution(
        &self,
        scheduled: &ScheduledCaseExecution,
    ) -> Result<CaseExecution>;

    /// Mark a case started
    async fn update_started_case_execution(
        &self,
        started: &StartedCaseExecution,
    ) -> Result<CaseExecution>;

    /// Mark a case finished
    async fn update_finished_case_execution(
        &self,
        finished: &FinishedCaseExecution,
    ) -> Result<CaseExecution>;

    /// Delete a case execution
    async fn delete_case_execution(
        &self,
        test_execution_id: TestExecutionId,
        id: CaseExecutionId,
    ) -> Result<()>;
}

/// Read operations for logs
#[async_trait]
pub trait LogReader: Send + Sync {
    /// Get a log by id
    async fn get_log(&self, id: Uuid) -> Result<ExecutionLog>;

    /// List the logs of a test execution in creation order
    async fn list_logs(&self, test_execution_id: TestExecutionId) -> Result<Vec<ExecutionLog>>;
}

/// Write operations for logs
#[async_trait]
pub trait LogWriter: Send + Sync {
    /// Append a log
    async fn create_log(&self, log: &ExecutionLog) -> Result<()>;

    /// Delete a log
    async fn delete_log(&self, id: Uuid) -> Result<()>;
}

/// Test read/write access
pub trait TestReadWriter: TestReader + TestWriter {}
impl<R: TestReader + TestWriter> TestReadWriter for R {}

/// Test execution read/write access
pub trait TestExecutionReadWriter: TestExecutionReader + TestExecutionWriter {}
impl<R: TestExecutionReader + TestExecutionWriter> TestExecutionReadWriter for R {}

/// Case execution read/write access
pub trait CaseExecutionReadWriter: CaseExecutionReader + CaseExecutionWriter {}
impl<R: CaseExecutionReader + CaseExecutionWriter> CaseExecutionReadWriter for R {}

/// Log read/write access
pub trait LogReadWriter: LogReader + LogWriter {}
impl<R: LogReader + LogWriter> LogReadWriter for R {}

/// Full repository
pub trait Repository:
    TestReadWriter + TestExecutionReadWriter + CaseExecutionReadWriter + LogReadWriter
{
    /// Backend name (for logging)
    fn name(&self) -> &str;
}
