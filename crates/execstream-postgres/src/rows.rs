//! Row shapes of the notifying tables
//!
//! Field names follow the column names, so the same structs decode both the
//! trigger's JSON payloads and query results.

#![allow(missing_docs)]

use chrono::{DateTime, Utc};
use execstream_core::{CaseExecution, CaseExecutionId, ExecutionLog, TestExecution, TestExecutionId};
use serde::Deserialize;
use uuid::Uuid;

/// `test_executions` row
#[derive(Debug, Clone, PartialEq, Deserialize, sqlx::FromRow)]
pub struct TestExecutionRow {
    pub id: Uuid,
    pub test_id: Uuid,
    #[serde(default)]
    pub has_input: bool,
    pub schedule_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl TestExecutionRow {
    /// Convert into the domain type
    #[must_use]
    pub fn into_execution(self) -> TestExecution {
        TestExecution {
            id: TestExecutionId::from_uuid(self.id),
            test_id: self.test_id,
            has_input: self.has_input,
            schedule_time: self.schedule_time,
            start_time: self.start_time,
            finish_time: self.finish_time,
            error: self.error,
        }
    }
}

/// `case_executions` row
#[derive(Debug, Clone, PartialEq, Deserialize, sqlx::FromRow)]
pub struct CaseExecutionRow {
    pub id: i32,
    pub test_exec_id: Uuid,
    #[serde(default)]
    pub case_name: String,
    pub schedule_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl CaseExecutionRow {
    /// Convert into the domain type; `now` stands in for a missing schedule time
    #[must_use]
    pub fn into_execution(self, now: DateTime<Utc>) -> CaseExecution {
        CaseExecution {
            id: CaseExecutionId::new(self.id),
            test_execution_id: TestExecutionId::from_uuid(self.test_exec_id),
            case_name: self.case_name,
            schedule_time: self.schedule_time.unwrap_or(now),
            start_time: self.start_time,
            finish_time: self.finish_time,
            error: self.error,
        }
    }
}

/// `logs` row
#[derive(Debug, Clone, PartialEq, Deserialize, sqlx::FromRow)]
pub struct LogRow {
    pub id: Uuid,
    pub test_exec_id: Uuid,
    pub case_exec_id: Option<i32>,
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub message: String,
    pub create_time: Option<DateTime<Utc>>,
}

impl LogRow {
    /// Convert into the domain type; `now` stands in for a missing create time
    #[must_use]
    pub fn into_log(self, now: DateTime<Utc>) -> ExecutionLog {
        ExecutionLog {
            id: self.id,
            test_execution_id: TestExecutionId::from_uuid(self.test_exec_id),
            case_execution_id: self.case_exec_id.map(CaseExecutionId::new),
            level: self.level,
            message: self.message,
            create_time: self.create_time.unwrap_or(now),
        }
    }
}
