//! Event translator
//!
//! Pure mapping from a change envelope to zero or one execution event:
//!
//! | table           | action | condition                 | event                  |
//! |-----------------|--------|---------------------------|------------------------|
//! | test_executions | UPDATE | finish time set           | TestExecutionFinished  |
//! | case_executions | INSERT |                           | CaseExecutionScheduled |
//! | case_executions | UPDATE | finish time set           | CaseExecutionFinished  |
//! | case_executions | UPDATE | start set, finish not set | CaseExecutionStarted   |
//! | logs            | INSERT |                           | LogPublished           |
//!
//! Everything else yields nothing. `TestExecutionScheduled` and
//! `TestExecutionStarted` are never produced here; clients observe a run
//! starting through its first case or log events.

use chrono::{DateTime, Utc};
use execstream_core::repository::tables;
use execstream_core::{EventData, EventType, ExecutionEvent};

use crate::envelope::{Action, Envelope};
use crate::error::TranslateError;
use crate::rows::{CaseExecutionRow, LogRow, TestExecutionRow};

/// Translate an envelope, stamping the event with the current time
pub fn translate(envelope: &Envelope) -> Result<Option<ExecutionEvent>, TranslateError> {
    translate_at(envelope, Utc::now())
}

/// Translate an envelope, stamping the event with `now`
///
/// Rows are decoded only for table/action pairs that can produce an event.
pub fn translate_at(
    envelope: &Envelope,
    now: DateTime<Utc>,
) -> Result<Option<ExecutionEvent>, TranslateError> {
    let (event_type, data) = match (envelope.table.as_str(), envelope.action) {
        (tables::TEST_EXECUTIONS, Action::Update) => {
            let row: TestExecutionRow = envelope.row()?;
            if row.finish_time.is_none() {
                return Ok(None);
            }
            (
                EventType::TestExecutionFinished,
                EventData::TestExecution(row.into_execution()),
            )
        }
        (tables::CASE_EXECUTIONS, Action::Insert) => {
            let row: CaseExecutionRow = envelope.row()?;
            (
                EventType::CaseExecutionScheduled,
                EventData::CaseExecution(row.into_execution(now)),
            )
        }
        (tables::CASE_EXECUTIONS, Action::Update) => {
            let row: CaseExecutionRow = envelope.row()?;
            let event_type = match (row.start_time, row.finish_time) {
                (_, Some(_)) => EventType::CaseExecutionFinished,
                (Some(_), None) => EventType::CaseExecutionStarted,
                (None, None) => return Ok(None),
            };
            (event_type, EventData::CaseExecution(row.into_execution(now)))
        }
        (tables::LOGS, Action::Insert) => {
            let row: LogRow = envelope.row()?;
            (EventType::LogPublished, EventData::Log(row.into_log(now)))
        }
        _ => return Ok(None),
    };

    let test_execution_id = match &data {
        EventData::TestExecution(te) => te.id,
        EventData::CaseExecution(ce) => ce.test_execution_id,
        EventData::Log(log) => log.test_execution_id,
        EventData::None => return Ok(None),
    };
    if test_execution_id.is_nil() {
        return Err(TranslateError::Row {
            table: envelope.table.clone(),
            message: "nil test execution id".to_string(),
        });
    }

    Ok(Some(
        ExecutionEvent::new(test_execution_id, event_type, data).with_create_time(now),
    ))
}

#[cfg(test)]
mod tests;
