//! `watch` command

use std::future::Future;
use std::io::Write;

use anyhow::{Context, Result};
use execstream_core::{ExecutionEvent, TestExecutionId};
use execstream_postgres::{connect_pool, PgEventSource, SourceError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::settings::AppConfig;
use crate::shutdown::wait_for_shutdown_signal;

/// Follow one test execution until interrupted or the stream closes
pub async fn run(config: &AppConfig, test_execution_id: TestExecutionId) -> Result<()> {
    let pool = connect_pool(&config.database)
        .await
        .context("Failed to connect to database")?;
    let mut source = PgEventSource::connect(&pool, &config.events)
        .await
        .context("Failed to open notification connection")?;

    let (mut events, unsubscribe) = source.subscribe(test_execution_id);
    let cancel = CancellationToken::new();
    let mut errors = source
        .start(cancel.clone())
        .context("Failed to start event source")?;
    info!(%test_execution_id, channel = %config.events.channel, "Watching execution events");

    let outcome = follow(
        &mut events,
        &mut errors,
        wait_for_shutdown_signal(),
        &mut std::io::stdout(),
    )
    .await;

    unsubscribe.unsubscribe();
    cancel.cancel();
    source.stop().await;
    pool.close().await;

    eprintln!("dropped events: {}", source.dropped_events());
    outcome
}

/// Write events as JSON lines until `shutdown` resolves or the stream closes.
///
/// A stream that closes after a fatal source error is an error, not a
/// normal end.
async fn follow<S, W>(
    events: &mut mpsc::Receiver<ExecutionEvent>,
    errors: &mut mpsc::Receiver<SourceError>,
    shutdown: S,
    out: &mut W,
) -> Result<()>
where
    S: Future<Output = ()>,
    W: Write,
{
    tokio::pin!(shutdown);
    let mut fatal = None;

    loop {
        tokio::select! {
            _ = &mut shutdown => return Ok(()),
            event = events.recv() => match event {
                Some(event) => write_event(out, &event)?,
                None => {
                    info!("Event stream closed");
                    while let Ok(err) = errors.try_recv() {
                        record(err, &mut fatal);
                    }
                    return match fatal {
                        Some(err) => Err(anyhow::Error::new(err).context("Event stream ended")),
                        None => Ok(()),
                    };
                }
            },
            Some(err) = errors.recv() => record(err, &mut fatal),
        }
    }
}

fn record(err: SourceError, fatal: &mut Option<SourceError>) {
    if err.is_fatal() {
        error!(error = %err, "Event source failed");
        *fatal = Some(err);
    } else {
        warn!(error = %err, "Event source reported an error");
    }
}

fn write_event<W: Write>(out: &mut W, event: &ExecutionEvent) -> Result<()> {
    let line = serde_json::to_string(&event.to_wire()).context("Failed to encode event")?;
    writeln!(out, "{line}").context("Failed to write event")?;
    Ok(())
}
