//! MemoryRepository - in-memory repository backend
//!
//! Mirrors what the Postgres backend does, including its change
//! notifications: when built with a notifier, every committed mutation of a
//! test execution, case execution or log is announced as the same
//! `{table, action, data}` JSON payload the database trigger emits. This lets
//! the whole event pipeline run without a database.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::execution::{
    CaseExecution, CaseExecutionId, ExecutionLog, FinishedCaseExecution, FinishedTestExecution,
    Payload, ResetTestExecution, ScheduledCaseExecution, ScheduledTestExecution,
    StartedCaseExecution, StartedTestExecution, Test, TestDefinition, TestExecution,
    TestExecutionId,
};
use crate::repository::{
    tables, CaseExecutionReader, CaseExecutionWriter, LogReader, LogWriter, Repository,
    ResetRollback, TestExecutionListFilter, TestExecutionReader, TestExecutionWriter, TestReader,
    TestWriter,
};

#[derive(Default)]
struct State {
    tests: HashMap<Uuid, Test>,
    test_executions: HashMap<TestExecutionId, TestExecution>,
    case_executions: BTreeMap<(TestExecutionId, CaseExecutionId), CaseExecution>,
    /// Last sequence number handed out per test execution
    case_sequences: HashMap<TestExecutionId, i32>,
    logs: Vec<ExecutionLog>,
    default_inputs: HashMap<Uuid, Payload>,
    execution_inputs: HashMap<TestExecutionId, Payload>,
}

impl State {
    fn test_execution_mut(&mut self, id: TestExecutionId) -> Result<&mut TestExecution> {
        self.test_executions
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("test execution", id))
    }

    fn case_execution_mut(
        &mut self,
        test_execution_id: TestExecutionId,
        id: CaseExecutionId,
    ) -> Result<&mut CaseExecution> {
        self.case_executions
            .get_mut(&(test_execution_id, id))
            .ok_or_else(|| Error::not_found("case execution", format!("{test_execution_id}/{id}")))
    }

    fn cases_of(&self, test_execution_id: TestExecutionId) -> Vec<CaseExecution> {
        let first = (test_execution_id, CaseExecutionId::new(i32::MIN));
        let last = (test_execution_id, CaseExecutionId::new(i32::MAX));
        self.case_executions
            .range(first..=last)
            .map(|(_, ce)| ce.clone())
            .collect()
    }
}

struct Inner {
    state: Mutex<State>,
    notifier: Option<mpsc::UnboundedSender<String>>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Announce a committed mutation. Called with the state lock held so
    /// notifications follow commit order.
    fn notify(&self, table: &str, action: &str, data: Value) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let payload = json!({ "table": table, "action": action, "data": data }).to_string();
        if notifier.send(payload).is_err() {
            debug!(table, action, "No listener for change notification");
        }
    }
}

/// In-memory [`Repository`] implementation
#[derive(Clone)]
pub struct MemoryRepository {
    inner: Arc<Inner>,
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRepository {
    /// Create a repository that emits no notifications
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a repository that announces mutations on `notifier`
    #[must_use]
    pub fn with_notifier(notifier: mpsc::UnboundedSender<String>) -> Self {
        Self::build(Some(notifier))
    }

    fn build(notifier: Option<mpsc::UnboundedSender<String>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                notifier,
            }),
        }
    }
}

fn test_execution_row(te: &TestExecution) -> Value {
    json!({
        "id": te.id,
        "test_id": te.test_id,
        "has_input": te.has_input,
        "schedule_time": te.schedule_time,
        "start_time": te.start_time,
        "finish_time": te.finish_time,
        "error": te.error,
    })
}

fn case_execution_row(ce: &CaseExecution) -> Value {
    json!({
        "id": ce.id,
        "test_exec_id": ce.test_execution_id,
        "case_name": ce.case_name,
        "schedule_time": ce.schedule_time,
        "start_time": ce.start_time,
        "finish_time": ce.finish_time,
        "error": ce.error,
    })
}

fn log_row(log: &ExecutionLog) -> Value {
    json!({
        "id": log.id,
        "test_exec_id": log.test_execution_id,
        "case_exec_id": log.case_execution_id,
        "level": log.level,
        "message": log.message,
        "create_time": log.create_time,
    })
}

#[async_trait]
impl TestReader for MemoryRepository {
    async fn get_test(&self, id: Uuid) -> Result<Test> {
        self.inner
            .state()
            .tests
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("test", id))
    }

    async fn get_test_by_name(&self, group: &str, name: &str) -> Result<Test> {
        self.inner
            .state()
            .tests
            .values()
            .find(|t| t.group == group && t.name == name)
            .cloned()
            .ok_or_else(|| Error::not_found("test", format!("{group}/{name}")))
    }

    async fn list_tests(&self) -> Result<Vec<Test>> {
        let mut tests: Vec<Test> = self.inner.state().tests.values().cloned().collect();
        tests.sort_by(|a, b| (&a.group, &a.name).cmp(&(&b.group, &b.name)));
        Ok(tests)
    }

    async fn get_test_default_input(&self, test_id: Uuid) -> Result<Payload> {
        self.inner
            .state()
            .default_inputs
            .get(&test_id)
            .cloned()
            .ok_or_else(|| Error::not_found("test default input", test_id))
    }
}

#[async_trait]
impl TestWriter for MemoryRepository {
    #[instrument(skip(self, definition), fields(group = %definition.group, name = %definition.name))]
    async fn create_test(&self, definition: &TestDefinition) -> Result<Test> {
        let now = Utc::now();
        let mut state = self.inner.state();
        let existing = state
            .tests
            .values()
            .find(|t| t.group == definition.group && t.name == definition.name)
            .map(|t| t.id);

        let test = Test {
            id: existing.unwrap_or_else(Uuid::new_v4),
            group: definition.group.clone(),
            name: definition.name.clone(),
            has_input: definition.has_input,
            runner_id: definition.runner_id.clone(),
            runner_heartbeat_at: now,
            create_time: now,
        };
        state.tests.insert(test.id, test.clone());

        debug!(test_id = %test.id, updated = existing.is_some(), "Upserted test");
        Ok(test)
    }

    async fn create_test_default_input(&self, test_id: Uuid, input: &Payload) -> Result<()> {
        let mut state = self.inner.state();
        if !state.tests.contains_key(&test_id) {
            return Err(Error::not_found("test", test_id));
        }
        state.default_inputs.insert(test_id, input.clone());
        Ok(())
    }
}

#[async_trait]
impl TestExecutionReader for MemoryRepository {
    async fn get_test_execution(&self, id: TestExecutionId) -> Result<TestExecution> {
        self.inner
            .state()
            .test_executions
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("test execution", id))
    }

    async fn get_test_execution_input(&self, id: TestExecutionId) -> Result<Payload> {
        self.inner
            .state()
            .execution_inputs
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("test execution input", id))
    }

    async fn list_test_executions(
        &self,
        test_id: Uuid,
        filter: &TestExecutionListFilter,
    ) -> Result<Vec<TestExecution>> {
        let mut execs: Vec<TestExecution> = self
            .inner
            .state()
            .test_executions
            .values()
            .filter(|te| te.test_id == test_id)
            .filter(|te| {
                filter
                    .after
                    .map_or(true, |cursor| (te.schedule_time, te.id) < cursor)
            })
            .cloned()
            .collect();

        execs.sort_by(|a, b| (b.schedule_time, b.id).cmp(&(a.schedule_time, a.id)));
        if let Some(size) = filter.page_size {
            execs.truncate(size);
        }
        Ok(execs)
    }
}

#[async_trait]
impl TestExecutionWriter for MemoryRepository {
    async fn create_test_execution_input(
        &self,
        id: TestExecutionId,
        input: &Payload,
    ) -> Result<()> {
        let mut state = self.inner.state();
        state.test_execution_mut(id)?;
        state.execution_inputs.insert(id, input.clone());
        Ok(())
    }

    #[instrument(skip(self, scheduled), fields(test_execution_id = %scheduled.id))]
    async fn create_scheduled_test_execution(
        &self,
        scheduled: &ScheduledTestExecution,
    ) -> Result<TestExecution> {
        let mut state = self.inner.state();
        if !state.tests.contains_key(&scheduled.test_id) {
            return Err(Error::not_found("test", scheduled.test_id));
        }

        let te = TestExecution {
            id: scheduled.id,
            test_id: scheduled.test_id,
            has_input: scheduled.has_input,
            schedule_time: scheduled.schedule_time,
            start_time: None,
            finish_time: None,
            error: None,
        };
        let action = match state.test_executions.insert(te.id, te.clone()) {
            Some(_) => "UPDATE",
            None => "INSERT",
        };
        self.inner
            .notify(tables::TEST_EXECUTIONS, action, test_execution_row(&te));
        Ok(te)
    }

    #[instrument(skip(self, started), fields(test_execution_id = %started.id))]
    async fn update_started_test_execution(
        &self,
        started: &StartedTestExecution,
    ) -> Result<TestExecution> {
        let mut state = self.inner.state();
        let te = state.test_execution_mut(started.id)?;
        te.start(started.start_time)?;
        let te = te.clone();
        self.inner
            .notify(tables::TEST_EXECUTIONS, "UPDATE", test_execution_row(&te));
        Ok(te)
    }

    #[instrument(skip(self, finished), fields(test_execution_id = %finished.id))]
    async fn update_finished_test_execution(
        &self,
        finished: &FinishedTestExecution,
    ) -> Result<TestExecution> {
        let mut state = self.inner.state();
        let te = state.test_execution_mut(finished.id)?;
        te.finish(finished.finish_time, finished.error.clone())?;
        let te = te.clone();
        self.inner
            .notify(tables::TEST_EXECUTIONS, "UPDATE", test_execution_row(&te));
        Ok(te)
    }

    #[instrument(skip(self, reset), fields(test_execution_id = %reset.id))]
    async fn reset_test_execution(
        &self,
        reset: &ResetTestExecution,
    ) -> Result<(TestExecution, ResetRollback)> {
        let mut state = self.inner.state();
        let previous = state.test_execution_mut(reset.id)?.clone();
        let removed_cases = state.cases_of(reset.id);

        for ce in &removed_cases {
            state.case_executions.remove(&(ce.test_execution_id, ce.id));
            self.inner
                .notify(tables::CASE_EXECUTIONS, "DELETE", case_execution_row(ce));
        }

        let te = state.test_execution_mut(reset.id)?;
        te.reset(reset.reset_time);
        let te = te.clone();
        self.inner
            .notify(tables::TEST_EXECUTIONS, "UPDATE", test_execution_row(&te));
        drop(state);

        debug!(removed_cases = removed_cases.len(), "Reset test execution");

        let inner = Arc::clone(&self.inner);
        let rollback: ResetRollback = Box::new(move || {
            async move {
                let mut state = inner.state();
                for ce in state.cases_of(previous.id) {
                    state.case_executions.remove(&(ce.test_execution_id, ce.id));
                    inner.notify(tables::CASE_EXECUTIONS, "DELETE", case_execution_row(&ce));
                }
                for ce in removed_cases {
                    inner.notify(tables::CASE_EXECUTIONS, "INSERT", case_execution_row(&ce));
                    state
                        .case_executions
                        .insert((ce.test_execution_id, ce.id), ce);
                }
                inner.notify(
                    tables::TEST_EXECUTIONS,
                    "UPDATE",
                    test_execution_row(&previous),
                );
                debug!(test_execution_id = %previous.id, "Rolled back reset");
                state.test_executions.insert(previous.id, previous);
                Ok(())
            }
            .boxed()
        });

        Ok((te, rollback))
    }
}

#[async_trait]
impl CaseExecutionReader for MemoryRepository {
    async fn get_case_execution(
        &self,
        test_execution_id: TestExecutionId,
        id: CaseExecutionId,
    ) -> Result<CaseExecution> {
        let mut state = self.inner.state();
        state
            .case_execution_mut(test_execution_id, id)
            .map(|ce| ce.clone())
    }

    async fn list_case_executions(
        &self,
        test_execution_id: TestExecutionId,
    ) -> Result<Vec<CaseExecution>> {
        Ok(self.inner.state().cases_of(test_execution_id))
    }
}

#[async_trait]
impl CaseExecutionWriter for MemoryRepository {
    #[instrument(skip(self, scheduled), fields(test_execution_id = %scheduled.test_execution_id))]
    async fn create_scheduled_case_execution(
        &self,
        scheduled: &ScheduledCaseExecution,
    ) -> Result<CaseExecution> {
        let mut state = self.inner.state();
        if !state
            .test_executions
            .contains_key(&scheduled.test_execution_id)
        {
            return Err(Error::not_found(
                "test execution",
                scheduled.test_execution_id,
            ));
        }

        let seq = state
            .case_sequences
            .entry(scheduled.test_execution_id)
            .or_insert(0);
        *seq += 1;

        let ce = CaseExecution {
            id: CaseExecutionId::new(*seq),
            test_execution_id: scheduled.test_execution_id,
            case_name: scheduled.case_name.clone(),
            schedule_time: scheduled.schedule_time,
            start_time: None,
            finish_time: None,
            error: None,
        };
        state
            .case_executions
            .insert((ce.test_execution_id, ce.id), ce.clone());
        self.inner
            .notify(tables::CASE_EXECUTIONS, "INSERT", case_execution_row(&ce));
        Ok(ce)
    }

    #[instrument(skip(self, started), fields(test_execution_id = %started.test_execution_id, case_execution_id = %started.id))]
    async fn update_started_case_execution(
        &self,
        started: &StartedCaseExecution,
    ) -> Result<CaseExecution> {
        let mut state = self.inner.state();
        let ce = state.case_execution_mut(started.test_execution_id, started.id)?;
        ce.start(started.start_time)?;
        let ce = ce.clone();
        self.inner
            .notify(tables::CASE_EXECUTIONS, "UPDATE", case_execution_row(&ce));
        Ok(ce)
    }

    #[instrument(skip(self, finished), fields(test_execution_id = %finished.test_execution_id, case_execution_id = %finished.id))]
    async fn update_finished_case_execution(
        &self,
        finished: &FinishedCaseExecution,
    ) -> Result<CaseExecution> {
        let mut state = self.inner.state();
        let ce = state.case_execution_mut(finished.test_execution_id, finished.id)?;
        ce.finish(finished.finish_time, finished.error.clone())?;
        let ce = ce.clone();
        self.inner
            .notify(tables::CASE_EXECUTIONS, "UPDATE", case_execution_row(&ce));
        Ok(ce)
    }

    async fn delete_case_execution(
        &self,
        test_execution_id: TestExecutionId,
        id: CaseExecutionId,
    ) -> Result<()> {
        let mut state = self.inner.state();
        let ce = state
            .case_executions
            .remove(&(test_execution_id, id))
            .ok_or_else(|| Error::not_found("case execution", format!("{test_execution_id}/{id}")))?;
        self.inner
            .notify(tables::CASE_EXECUTIONS, "DELETE", case_execution_row(&ce));
        Ok(())
    }
}

#[async_trait]
impl LogReader for MemoryRepository {
    async fn get_log(&self, id: Uuid) -> Result<ExecutionLog> {
        self.inner
            .state()
            .logs
            .iter()
            .find(|log| log.id == id)
            .cloned()
            .ok_or_else(|| Error::not_found("log", id))
    }

    async fn list_logs(&self, test_execution_id: TestExecutionId) -> Result<Vec<ExecutionLog>> {
        Ok(self
            .inner
            .state()
            .logs
            .iter()
            .filter(|log| log.test_execution_id == test_execution_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl LogWriter for MemoryRepository {
    async fn create_log(&self, log: &ExecutionLog) -> Result<()> {
        let mut state = self.inner.state();
        if !state.test_executions.contains_key(&log.test_execution_id) {
            return Err(Error::not_found("test execution", log.test_execution_id));
        }
        state.logs.push(log.clone());
        self.inner.notify(tables::LOGS, "INSERT", log_row(log));
        Ok(())
    }

    async fn delete_log(&self, id: Uuid) -> Result<()> {
        let mut state = self.inner.state();
        let index = state
            .logs
            .iter()
            .position(|log| log.id == id)
            .ok_or_else(|| Error::not_found("log", id))?;
        let log = state.logs.remove(index);
        self.inner.notify(tables::LOGS, "DELETE", log_row(&log));
        Ok(())
    }
}

impl Repository for MemoryRepository {
    fn name(&self) -> &str {
        "memory"
    }
}
