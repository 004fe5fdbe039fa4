//! Schema and change-notification trigger
//!
//! Every statement is idempotent, so migrations run on each `migrate`.

use execstream_core::{Error, Result};
use sqlx::postgres::PgPool;
use tracing::{debug, info, instrument};

const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS tests (
        id UUID PRIMARY KEY,
        "group" TEXT NOT NULL,
        name TEXT NOT NULL,
        has_input BOOLEAN NOT NULL DEFAULT FALSE,
        runner_id TEXT NOT NULL,
        runner_heartbeat_at TIMESTAMPTZ NOT NULL,
        create_time TIMESTAMPTZ NOT NULL,
        UNIQUE ("group", name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS test_executions (
        id UUID PRIMARY KEY,
        test_id UUID NOT NULL REFERENCES tests(id) ON DELETE CASCADE,
        has_input BOOLEAN NOT NULL DEFAULT FALSE,
        schedule_time TIMESTAMPTZ NOT NULL,
        start_time TIMESTAMPTZ,
        finish_time TIMESTAMPTZ,
        error TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS case_execution_sequences (
        test_exec_id UUID PRIMARY KEY REFERENCES test_executions(id) ON DELETE CASCADE,
        last_id INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS case_executions (
        id INTEGER NOT NULL,
        test_exec_id UUID NOT NULL REFERENCES test_executions(id) ON DELETE CASCADE,
        case_name TEXT NOT NULL,
        schedule_time TIMESTAMPTZ NOT NULL,
        start_time TIMESTAMPTZ,
        finish_time TIMESTAMPTZ,
        error TEXT,
        PRIMARY KEY (test_exec_id, id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS logs (
        id UUID PRIMARY KEY,
        test_exec_id UUID NOT NULL REFERENCES test_executions(id) ON DELETE CASCADE,
        case_exec_id INTEGER,
        level TEXT NOT NULL,
        message TEXT NOT NULL,
        create_time TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS test_default_inputs (
        test_id UUID PRIMARY KEY REFERENCES tests(id) ON DELETE CASCADE,
        data BYTEA NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS test_execution_inputs (
        test_execution_id UUID PRIMARY KEY REFERENCES test_executions(id) ON DELETE CASCADE,
        data BYTEA NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_test_executions_test
    ON test_executions(test_id, schedule_time DESC, id DESC)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_logs_test_exec
    ON logs(test_exec_id, create_time)
    "#,
];

const NOTIFYING_TABLES: &[&str] = &["test_executions", "case_executions", "logs"];

/// `pg_notify` rejects payloads of 8000 bytes or more
const MAX_PAYLOAD_BYTES: usize = 7900;

/// Characters kept of `message`/`error` in an oversized notification
const TRUNCATED_TEXT_CHARS: usize = 1024;

// Four bytes per character at worst, plus room for the other columns.
const _: () = assert!(TRUNCATED_TEXT_CHARS * 4 + 1024 < MAX_PAYLOAD_BYTES);

/// Create tables, indexes and the notification trigger
#[instrument(skip(pool))]
pub async fn run_migrations(pool: &PgPool, channel: &str) -> Result<()> {
    for statement in TABLES {
        execute(pool, statement).await?;
    }

    execute(pool, &notify_function(channel)?).await?;
    for table in NOTIFYING_TABLES {
        execute(
            pool,
            &format!("DROP TRIGGER IF EXISTS {table}_notify ON {table}"),
        )
        .await?;
        execute(
            pool,
            &format!(
                "CREATE TRIGGER {table}_notify AFTER INSERT OR UPDATE OR DELETE ON {table} \
                 FOR EACH ROW EXECUTE FUNCTION notify_execution_event()"
            ),
        )
        .await?;
        debug!(table, "Notification trigger installed");
    }

    info!(channel, "Database migrations complete");
    Ok(())
}

async fn execute(pool: &PgPool, statement: &str) -> Result<()> {
    sqlx::query(statement)
        .execute(pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
    Ok(())
}

/// Trigger function publishing `{table, action, data}` on `channel`
///
/// When the payload would exceed the notification limit, `message` and
/// `error` are cut to [`TRUNCATED_TEXT_CHARS`] so the write still commits.
fn notify_function(channel: &str) -> Result<String> {
    if channel.is_empty()
        || !channel
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(Error::Internal(format!(
            "invalid notification channel name: {channel:?}"
        )));
    }

    Ok(format!(
        r#"
        CREATE OR REPLACE FUNCTION notify_execution_event() RETURNS trigger AS $$
        DECLARE
            row_data JSONB;
            payload TEXT;
        BEGIN
            IF TG_OP = 'DELETE' THEN
                row_data := to_jsonb(OLD);
            ELSE
                row_data := to_jsonb(NEW);
            END IF;
            payload := json_build_object(
                'table', TG_TABLE_NAME,
                'action', TG_OP,
                'data', row_data
            )::text;
            IF octet_length(payload) >= {MAX_PAYLOAD_BYTES} THEN
                IF row_data->>'message' IS NOT NULL THEN
                    row_data := jsonb_set(row_data, '{{message}}',
                        to_jsonb(left(row_data->>'message', {TRUNCATED_TEXT_CHARS})));
                END IF;
                IF row_data->>'error' IS NOT NULL THEN
                    row_data := jsonb_set(row_data, '{{error}}',
                        to_jsonb(left(row_data->>'error', {TRUNCATED_TEXT_CHARS})));
                END IF;
                payload := json_build_object(
                    'table', TG_TABLE_NAME,
                    'action', TG_OP,
                    'data', row_data
                )::text;
            END IF;
            PERFORM pg_notify('{channel}', payload);
            RETURN NULL;
        END;
        $$ LANGUAGE plpgsql
        "#
    ))
}
