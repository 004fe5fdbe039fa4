//! Helper functions for store module

use execstream_core::{Error, Test};
use sqlx::postgres::PgRow;
use sqlx::Row;

const FOREIGN_KEY_VIOLATION: &str = "23503";

pub(crate) const TEST_COLUMNS: &str =
    r#"id, "group", name, has_input, runner_id, runner_heartbeat_at, create_time"#;
pub(crate) const TEST_EXECUTION_COLUMNS: &str =
    "id, test_id, has_input, schedule_time, start_time, finish_time, error";
pub(crate) const CASE_EXECUTION_COLUMNS: &str =
    "id, test_exec_id, case_name, schedule_time, start_time, finish_time, error";
pub(crate) const LOG_COLUMNS: &str =
    "id, test_exec_id, case_exec_id, level, message, create_time";

/// Map a database error
pub(crate) fn db_error(e: sqlx::Error) -> Error {
    Error::Database(e.to_string())
}

/// Map a write error, reporting a missing parent row as `NotFound`
pub(crate) fn write_error(e: sqlx::Error, parent: &'static str, id: impl ToString) -> Error {
    let missing_parent = e
        .as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == FOREIGN_KEY_VIOLATION);
    if missing_parent {
        Error::not_found(parent, id)
    } else {
        db_error(e)
    }
}

/// Convert a Postgres row to a Test
pub(crate) fn row_to_test(row: &PgRow) -> Result<Test, Error> {
    Ok(Test {
        id: row.try_get("id").map_err(db_error)?,
        group: row.try_get("group").map_err(db_error)?,
        name: row.try_get("name").map_err(db_error)?,
        has_input: row.try_get("has_input").map_err(db_error)?,
        runner_id: row.try_get("runner_id").map_err(db_error)?,
        runner_heartbeat_at: row.try_get("runner_heartbeat_at").map_err(db_error)?,
        create_time: row.try_get("create_time").map_err(db_error)?,
    })
}
