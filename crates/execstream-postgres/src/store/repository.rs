//! PgRepository - Postgres-backed repository

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use execstream_core::repository::{
    CaseExecutionReader, CaseExecutionWriter, LogReader, LogWriter, Repository, ResetRollback,
    TestExecutionListFilter, TestExecutionReader, TestExecutionWriter, TestReader, TestWriter,
};
use execstream_core::{
    CaseExecution, CaseExecutionId, Error, ExecutionLog, FinishedCaseExecution,
    FinishedTestExecution, Payload, ResetTestExecution, Result, ScheduledCaseExecution,
    ScheduledTestExecution, StartedCaseExecution, StartedTestExecution, Test, TestDefinition,
    TestExecution, TestExecutionId,
};
use sqlx::postgres::PgPool;
use sqlx::{Postgres, Transaction};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::helpers::{
    db_error, row_to_test, write_error, CASE_EXECUTION_COLUMNS, LOG_COLUMNS, TEST_COLUMNS,
    TEST_EXECUTION_COLUMNS,
};
use crate::rows::{CaseExecutionRow, LogRow, TestExecutionRow};

/// Repository over a Postgres pool
#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    /// Create a repository with the given connection pool
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying pool
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        self.pool.begin().await.map_err(db_error)
    }
}

async fn lock_test_execution(
    tx: &mut Transaction<'_, Postgres>,
    id: TestExecutionId,
) -> Result<TestExecution> {
    let row: Option<TestExecutionRow> = sqlx::query_as(&format!(
        "SELECT {TEST_EXECUTION_COLUMNS} FROM test_executions WHERE id = $1 FOR UPDATE"
    ))
    .bind(id.as_uuid())
    .fetch_optional(&mut **tx)
    .await
    .map_err(db_error)?;

    row.map(TestExecutionRow::into_execution)
        .ok_or_else(|| Error::not_found("test execution", id))
}

async fn write_test_execution(
    tx: &mut Transaction<'_, Postgres>,
    te: &TestExecution,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE test_executions
        SET schedule_time = $2, start_time = $3, finish_time = $4, error = $5
        WHERE id = $1
        "#,
    )
    .bind(te.id.as_uuid())
    .bind(te.schedule_time)
    .bind(te.start_time)
    .bind(te.finish_time)
    .bind(&te.error)
    .execute(&mut **tx)
    .await
    .map_err(db_error)?;
    Ok(())
}

async fn lock_case_execution(
    tx: &mut Transaction<'_, Postgres>,
    test_execution_id: TestExecutionId,
    id: CaseExecutionId,
) -> Result<CaseExecution> {
    let row: Option<CaseExecutionRow> = sqlx::query_as(&format!(
        "SELECT {CASE_EXECUTION_COLUMNS} FROM case_executions \
         WHERE test_exec_id = $1 AND id = $2 FOR UPDATE"
    ))
    .bind(test_execution_id.as_uuid())
    .bind(id.get())
    .fetch_optional(&mut **tx)
    .await
    .map_err(db_error)?;

    row.map(|row| row.into_execution(Utc::now()))
        .ok_or_else(|| Error::not_found("case execution", format!("{test_execution_id}/{id}")))
}

async fn write_case_execution(
    tx: &mut Transaction<'_, Postgres>,
    ce: &CaseExecution,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE case_executions
        SET start_time = $3, finish_time = $4, error = $5
        WHERE test_exec_id = $1 AND id = $2
        "#,
    )
    .bind(ce.test_execution_id.as_uuid())
    .bind(ce.id.get())
    .bind(ce.start_time)
    .bind(ce.finish_time)
    .bind(&ce.error)
    .execute(&mut **tx)
    .await
    .map_err(db_error)?;
    Ok(())
}

async fn insert_case_execution(
    tx: &mut Transaction<'_, Postgres>,
    ce: &CaseExecution,
) -> Result<()> {
    sqlx::query(&format!(
        "INSERT INTO case_executions ({CASE_EXECUTION_COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)"
    ))
    .bind(ce.id.get())
    .bind(ce.test_execution_id.as_uuid())
    .bind(&ce.case_name)
    .bind(ce.schedule_time)
    .bind(ce.start_time)
    .bind(ce.finish_time)
    .bind(&ce.error)
    .execute(&mut **tx)
    .await
    .map_err(|e| write_error(e, "test execution", ce.test_execution_id))?;
    Ok(())
}

/// Undo a reset: restore the row and the case executions it removed
async fn restore_reset(
    pool: PgPool,
    previous: TestExecution,
    removed: Vec<CaseExecution>,
) -> Result<()> {
    let mut tx = pool.begin().await.map_err(db_error)?;

    sqlx::query("DELETE FROM case_executions WHERE test_exec_id = $1")
        .bind(previous.id.as_uuid())
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;
    for ce in &removed {
        insert_case_execution(&mut tx, ce).await?;
    }
    write_test_execution(&mut tx, &previous).await?;

    tx.commit().await.map_err(db_error)?;
    debug!(test_execution_id = %previous.id, restored_cases = removed.len(), "Rolled back reset");
    Ok(())
}

#[async_trait]
impl TestReader for PgRepository {
    async fn get_test(&self, id: Uuid) -> Result<Test> {
        let row = sqlx::query(&format!("SELECT {TEST_COLUMNS} FROM tests WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        match row {
            Some(row) => row_to_test(&row),
            None => Err(Error::not_found("test", id)),
        }
    }

    async fn get_test_by_name(&self, group: &str, name: &str) -> Result<Test> {
        let row = sqlx::query(&format!(
            r#"SELECT {TEST_COLUMNS} FROM tests WHERE "group" = $1 AND name = $2"#
        ))
        .bind(group)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        match row {
            Some(row) => row_to_test(&row),
            None => Err(Error::not_found("test", format!("{group}/{name}"))),
        }
    }

    async fn list_tests(&self) -> Result<Vec<Test>> {
        let rows = sqlx::query(&format!(
            r#"SELECT {TEST_COLUMNS} FROM tests ORDER BY "group", name"#
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(row_to_test).collect()
    }

    async fn get_test_default_input(&self, test_id: Uuid) -> Result<Payload> {
        let data: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT data FROM test_default_inputs WHERE test_id = $1")
                .bind(test_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error)?;

        data.map(Payload::new)
            .ok_or_else(|| Error::not_found("test default input", test_id))
    }
}

#[async_trait]
impl TestWriter for PgRepository {
    #[instrument(skip(self, definition), fields(group = %definition.group, name = %definition.name))]
    async fn create_test(&self, definition: &TestDefinition) -> Result<Test> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO tests ({TEST_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            ON CONFLICT ("group", name) DO UPDATE SET
                has_input = EXCLUDED.has_input,
                runner_id = EXCLUDED.runner_id,
                runner_heartbeat_at = EXCLUDED.runner_heartbeat_at,
                create_time = EXCLUDED.create_time
            RETURNING {TEST_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&definition.group)
        .bind(&definition.name)
        .bind(definition.has_input)
        .bind(&definition.runner_id)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;

        let test = row_to_test(&row)?;
        debug!(test_id = %test.id, "Upserted test");
        Ok(test)
    }

    async fn create_test_default_input(&self, test_id: Uuid, input: &Payload) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO test_default_inputs (test_id, data)
            VALUES ($1, $2)
            ON CONFLICT (test_id) DO UPDATE SET data = EXCLUDED.data
            "#,
        )
        .bind(test_id)
        .bind(input.as_bytes())
        .execute(&self.pool)
        .await
        .map_err(|e| write_error(e, "test", test_id))?;
        Ok(())
    }
}

#[async_trait]
impl TestExecutionReader for PgRepository {
    async fn get_test_execution(&self, id: TestExecutionId) -> Result<TestExecution> {
        let row: Option<TestExecutionRow> = sqlx::query_as(&format!(
            "SELECT {TEST_EXECUTION_COLUMNS} FROM test_executions WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.map(TestExecutionRow::into_execution)
            .ok_or_else(|| Error::not_found("test execution", id))
    }

    async fn get_test_execution_input(&self, id: TestExecutionId) -> Result<Payload> {
        let data: Option<Vec<u8>> = sqlx::query_scalar(
            "SELECT data FROM test_execution_inputs WHERE test_execution_id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        data.map(Payload::new)
            .ok_or_else(|| Error::not_found("test execution input", id))
    }

    async fn list_test_executions(
        &self,
        test_id: Uuid,
        filter: &TestExecutionListFilter,
    ) -> Result<Vec<TestExecution>> {
        let (after_time, after_id) = match filter.after {
            Some((time, id)) => (Some(time), Some(id.as_uuid())),
            None => (None, None),
        };
        let limit = filter
            .page_size
            .map(|size| i64::try_from(size).unwrap_or(i64::MAX));

        let rows: Vec<TestExecutionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {TEST_EXECUTION_COLUMNS} FROM test_executions
            WHERE test_id = $1
              AND ($2::timestamptz IS NULL OR (schedule_time, id) < ($2, $3))
            ORDER BY schedule_time DESC, id DESC
            LIMIT $4
            "#
        ))
        .bind(test_id)
        .bind(after_time)
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(rows.into_iter().map(TestExecutionRow::into_execution).collect())
    }
}

#[async_trait]
impl TestExecutionWriter for PgRepository {
    async fn create_test_execution_input(
        &self,
        id: TestExecutionId,
        input: &Payload,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO test_execution_inputs (test_execution_id, data)
            VALUES ($1, $2)
            ON CONFLICT (test_execution_id) DO UPDATE SET data = EXCLUDED.data
            "#,
        )
        .bind(id.as_uuid())
        .bind(input.as_bytes())
        .execute(&self.pool)
        .await
        .map_err(|e| write_error(e, "test execution", id))?;
        Ok(())
    }

    #[instrument(skip(self, scheduled), fields(test_execution_id = %scheduled.id))]
    async fn create_scheduled_test_execution(
        &self,
        scheduled: &ScheduledTestExecution,
    ) -> Result<TestExecution> {
        let row: TestExecutionRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO test_executions (id, test_id, has_input, schedule_time)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                test_id = EXCLUDED.test_id,
                has_input = EXCLUDED.has_input,
                schedule_time = EXCLUDED.schedule_time,
                start_time = NULL,
                finish_time = NULL,
                error = NULL
            RETURNING {TEST_EXECUTION_COLUMNS}
            "#
        ))
        .bind(scheduled.id.as_uuid())
        .bind(scheduled.test_id)
        .bind(scheduled.has_input)
        .bind(scheduled.schedule_time)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| write_error(e, "test", scheduled.test_id))?;

        Ok(row.into_execution())
    }

    #[instrument(skip(self, started), fields(test_execution_id = %started.id))]
    async fn update_started_test_execution(
        &self,
        started: &StartedTestExecution,
    ) -> Result<TestExecution> {
        let mut tx = self.begin().await?;
        let mut te = lock_test_execution(&mut tx, started.id).await?;
        te.start(started.start_time)?;
        write_test_execution(&mut tx, &te).await?;
        tx.commit().await.map_err(db_error)?;
        Ok(te)
    }

    #[instrument(skip(self, finished), fields(test_execution_id = %finished.id))]
    async fn update_finished_test_execution(
        &self,
        finished: &FinishedTestExecution,
    ) -> Result<TestExecution> {
        let mut tx = self.begin().await?;
        let mut te = lock_test_execution(&mut tx, finished.id).await?;
        te.finish(finished.finish_time, finished.error.clone())?;
        write_test_execution(&mut tx, &te).await?;
        tx.commit().await.map_err(db_error)?;
        Ok(te)
    }

    #[instrument(skip(self, reset), fields(test_execution_id = %reset.id))]
    async fn reset_test_execution(
        &self,
        reset: &ResetTestExecution,
    ) -> Result<(TestExecution, ResetRollback)> {
        let mut tx = self.begin().await?;
        let previous = lock_test_execution(&mut tx, reset.id).await?;

        let removed: Vec<CaseExecutionRow> = sqlx::query_as(&format!(
            "DELETE FROM case_executions WHERE test_exec_id = $1 \
             RETURNING {CASE_EXECUTION_COLUMNS}"
        ))
        .bind(reset.id.as_uuid())
        .fetch_all(&mut *tx)
        .await
        .map_err(db_error)?;
        let now = Utc::now();
        let mut removed: Vec<CaseExecution> = removed
            .into_iter()
            .map(|row| row.into_execution(now))
            .collect();
        removed.sort_by_key(|ce| ce.id);

        let mut te = previous.clone();
        te.reset(reset.reset_time);
        write_test_execution(&mut tx, &te).await?;
        tx.commit().await.map_err(db_error)?;

        debug!(removed_cases = removed.len(), "Reset test execution");

        let pool = self.pool.clone();
        let rollback: ResetRollback =
            Box::new(move || restore_reset(pool, previous, removed).boxed());
        Ok((te, rollback))
    }
}

#[async_trait]
impl CaseExecutionReader for PgRepository {
    async fn get_case_execution(
        &self,
        test_execution_id: TestExecutionId,
        id: CaseExecutionId,
    ) -> Result<CaseExecution> {
        let row: Option<CaseExecutionRow> = sqlx::query_as(&format!(
            "SELECT {CASE_EXECUTION_COLUMNS} FROM case_executions \
             WHERE test_exec_id = $1 AND id = $2"
        ))
        .bind(test_execution_id.as_uuid())
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.map(|row| row.into_execution(Utc::now()))
            .ok_or_else(|| Error::not_found("case execution", format!("{test_execution_id}/{id}")))
    }

    async fn list_case_executions(
        &self,
        test_execution_id: TestExecutionId,
    ) -> Result<Vec<CaseExecution>> {
        let rows: Vec<CaseExecutionRow> = sqlx::query_as(&format!(
            "SELECT {CASE_EXECUTION_COLUMNS} FROM case_executions \
             WHERE test_exec_id = $1 ORDER BY id"
        ))
        .bind(test_execution_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        let now = Utc::now();
        Ok(rows.into_iter().map(|row| row.into_execution(now)).collect())
    }
}

#[async_trait]
impl CaseExecutionWriter for PgRepository {
    #[instrument(skip(self, scheduled), fields(test_execution_id = %scheduled.test_execution_id))]
    async fn create_scheduled_case_execution(
        &self,
        scheduled: &ScheduledCaseExecution,
    ) -> Result<CaseExecution> {
        let mut tx = self.begin().await?;

        // The counter survives deletes and resets, so ids are never reused.
        let seq: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO case_execution_sequences (test_exec_id, last_id)
            VALUES ($1, 1)
            ON CONFLICT (test_exec_id) DO UPDATE
            SET last_id = case_execution_sequences.last_id + 1
            RETURNING last_id
            "#,
        )
        .bind(scheduled.test_execution_id.as_uuid())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| write_error(e, "test execution", scheduled.test_execution_id))?;

        let ce = CaseExecution {
            id: CaseExecutionId::new(seq),
            test_execution_id: scheduled.test_execution_id,
            case_name: scheduled.case_name.clone(),
            schedule_time: scheduled.schedule_time,
            start_time: None,
            finish_time: None,
            error: None,
        };
        insert_case_execution(&mut tx, &ce).await?;
        tx.commit().await.map_err(db_error)?;
        Ok(ce)
    }

    #[instrument(skip(self, started), fields(test_execution_id = %started.test_execution_id, case_execution_id = %started.id))]
    async fn update_started_case_execution(
        &self,
        started: &StartedCaseExecution,
    ) -> Result<CaseExecution> {
        let mut tx = self.begin().await?;
        let mut ce = lock_case_execution(&mut tx, started.test_execution_id, started.id).await?;
        ce.start(started.start_time)?;
        write_case_execution(&mut tx, &ce).await?;
        tx.commit().await.map_err(db_error)?;
        Ok(ce)
    }

    #[instrument(skip(self, finished), fields(test_execution_id = %finished.test_execution_id, case_execution_id = %finished.id))]
    async fn update_finished_case_execution(
        &self,
        finished: &FinishedCaseExecution,
    ) -> Result<CaseExecution> {
        let mut tx = self.begin().await?;
        let mut ce = lock_case_execution(&mut tx, finished.test_execution_id, finished.id).await?;
        ce.finish(finished.finish_time, finished.error.clone())?;
        write_case_execution(&mut tx, &ce).await?;
        tx.commit().await.map_err(db_error)?;
        Ok(ce)
    }

    async fn delete_case_execution(
        &self,
        test_execution_id: TestExecutionId,
        id: CaseExecutionId,
    ) -> Result<()> {
        let result = sqlx::query("DELETE FROM case_executions WHERE test_exec_id = $1 AND id = $2")
            .bind(test_execution_id.as_uuid())
            .bind(id.get())
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(
                "case execution",
                format!("{test_execution_id}/{id}"),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl LogReader for PgRepository {
    async fn get_log(&self, id: Uuid) -> Result<ExecutionLog> {
        let row: Option<LogRow> =
            sqlx::query_as(&format!("SELECT {LOG_COLUMNS} FROM logs WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error)?;

        row.map(|row| row.into_log(Utc::now()))
            .ok_or_else(|| Error::not_found("log", id))
    }

    async fn list_logs(&self, test_execution_id: TestExecutionId) -> Result<Vec<ExecutionLog>> {
        let rows: Vec<LogRow> = sqlx::query_as(&format!(
            "SELECT {LOG_COLUMNS} FROM logs WHERE test_exec_id = $1 ORDER BY create_time, id"
        ))
        .bind(test_execution_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        let now = Utc::now();
        Ok(rows.into_iter().map(|row| row.into_log(now)).collect())
    }
}

#[async_trait]
impl LogWriter for PgRepository {
    async fn create_log(&self, log: &ExecutionLog) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO logs ({LOG_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6)"
        ))
        .bind(log.id)
        .bind(log.test_execution_id.as_uuid())
        .bind(log.case_execution_id.map(|id| id.get()))
        .bind(&log.level)
        .bind(&log.message)
        .bind(log.create_time)
        .execute(&self.pool)
        .await
        .map_err(|e| write_error(e, "test execution", log.test_execution_id))?;
        Ok(())
    }

    async fn delete_log(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM logs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("log", id));
        }
        Ok(())
    }
}

impl Repository for PgRepository {
    fn name(&self) -> &str {
        "postgres"
    }
}
