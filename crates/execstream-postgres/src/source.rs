//! Event source
//!
//! Wires a [`ChangeListener`], the translator and a [`Broker`] into one
//! dispatch loop running on its own task. The source moves through
//! `Created -> Started -> Stopped`:
//! - `subscribe` is valid in every state
//! - `start` is allowed once; a second call is a programming error
//! - `stop` cancels the loop, waits for it, and is a no-op once stopped
//!
//! When the loop exits it stops the broker before releasing the listener, so
//! nothing is published after the connection goes back to the pool.

use std::fmt;

use execstream_core::{Broker, ExecutionEvent, TestExecutionId, Unsubscribe};
use sqlx::postgres::PgPool;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::EventsConfig;
use crate::error::{ListenError, SourceError};
use crate::listener::{ChangeListener, PgChangeListener};
use crate::translator::translate;

/// Event source over a Postgres notification connection
pub type PgEventSource = EventSource<PgChangeListener>;

enum SourceState<L> {
    Created(L),
    Started {
        scope: CancellationToken,
        task: JoinHandle<()>,
    },
    Stopped,
}

impl<L> SourceState<L> {
    fn name(&self) -> &'static str {
        match self {
            Self::Created(_) => "created",
            Self::Started { .. } => "started",
            Self::Stopped => "stopped",
        }
    }
}

/// Listener to translator to broker pipeline
pub struct EventSource<L> {
    broker: Broker<TestExecutionId, ExecutionEvent>,
    error_buffer: usize,
    state: SourceState<L>,
}

impl<L> fmt::Debug for EventSource<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSource")
            .field("state", &self.state.name())
            .field("broker", &self.broker)
            .finish()
    }
}

impl PgEventSource {
    /// Acquire a dedicated notification connection from `pool`
    pub async fn connect(pool: &PgPool, config: &EventsConfig) -> Result<Self, SourceError> {
        let listener = PgChangeListener::connect(pool, &config.channel).await?;
        Ok(Self::new(listener, config))
    }
}

impl<L: ChangeListener> EventSource<L> {
    /// Create a source that owns `listener`
    #[must_use]
    pub fn new(listener: L, config: &EventsConfig) -> Self {
        Self {
            broker: Broker::new(config.broker_config()),
            error_buffer: config.error_buffer.max(1),
            state: SourceState::Created(listener),
        }
    }

    /// Start the dispatch loop.
    ///
    /// Returns the stream of reported errors. It closes when the loop ends;
    /// cancellation ends the loop without reporting anything.
    #[instrument(skip_all)]
    pub fn start(
        &mut self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<SourceError>, SourceError> {
        match &self.state {
            SourceState::Created(_) => {}
            SourceState::Started { .. } => {
                error!("Event source started twice");
                return Err(SourceError::AlreadyStarted);
            }
            SourceState::Stopped => {
                error!("Event source started after stop");
                return Err(SourceError::Stopped);
            }
        }

        // The loop task stops the broker itself, after its last publish.
        self.broker.start(CancellationToken::new())?;

        let SourceState::Created(listener) =
            std::mem::replace(&mut self.state, SourceState::Stopped)
        else {
            return Err(SourceError::AlreadyStarted);
        };

        let scope = cancel.child_token();
        let (errors_tx, errors_rx) = mpsc::channel(self.error_buffer);
        let task = tokio::spawn(dispatch(
            listener,
            self.broker.clone(),
            scope.clone(),
            errors_tx,
        ));

        self.state = SourceState::Started { scope, task };
        info!("Event source started");
        Ok(errors_rx)
    }

    /// Subscribe to the events of one test execution
    pub fn subscribe(
        &self,
        test_execution_id: TestExecutionId,
    ) -> (mpsc::Receiver<ExecutionEvent>, Unsubscribe) {
        self.broker.subscribe(test_execution_id)
    }

    /// Stop the loop, close every subscriber and release the connection
    pub async fn stop(&mut self) {
        match std::mem::replace(&mut self.state, SourceState::Stopped) {
            SourceState::Created(listener) => {
                self.broker.stop();
                listener.release().await;
                debug!("Event source stopped before start");
            }
            SourceState::Started { scope, task } => {
                scope.cancel();
                if let Err(e) = task.await {
                    error!(error = %e, "Event source task failed");
                }
                self.broker.stop();
                info!(
                    dropped_events = self.broker.dropped(),
                    "Event source stopped"
                );
            }
            SourceState::Stopped => debug!("Event source already stopped"),
        }
    }

    /// Events dropped for slow subscribers
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.broker.dropped()
    }

    /// Whether the dispatch loop is still running
    #[must_use]
    pub fn is_running(&self) -> bool {
        match &self.state {
            SourceState::Started { task, .. } => !task.is_finished(),
            _ => false,
        }
    }
}

impl<L> Drop for EventSource<L> {
    fn drop(&mut self) {
        // The loop releases the listener once it sees the cancellation.
        if let SourceState::Started { scope, .. } = &self.state {
            scope.cancel();
        }
    }
}

async fn dispatch<L: ChangeListener>(
    mut listener: L,
    broker: Broker<TestExecutionId, ExecutionEvent>,
    scope: CancellationToken,
    errors: mpsc::Sender<SourceError>,
) {
    loop {
        let envelope = match listener.wait_next(&scope).await {
            Ok(envelope) => envelope,
            Err(ListenError::Cancelled) => {
                debug!("Dispatch loop cancelled");
                break;
            }
            Err(e) if e.is_fatal() => {
                error!(error = %e, "Notification connection failed");
                report(&errors, e.into());
                break;
            }
            Err(e) => {
                warn!(error = %e, "Skipping notification");
                report(&errors, e.into());
                continue;
            }
        };

        let event = match translate(&envelope) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, action = %envelope.action, "Translation failed");
                report(&errors, e.into());
                continue;
            }
        };

        let topic = event.test_execution_id;
        let event_type = event.event_type;
        match broker.publish(&topic, event) {
            Ok(delivered) => {
                debug!(test_execution_id = %topic, %event_type, delivered, "Event published");
            }
            Err(e) => {
                error!(error = %e, "Publish failed");
                report(&errors, e.into());
                break;
            }
        }
    }

    broker.stop();
    listener.release().await;
}

fn report(errors: &mpsc::Sender<SourceError>, err: SourceError) {
    match errors.try_send(err) {
        Ok(()) => {}
        Err(TrySendError::Full(err)) => {
            warn!(error = %err, "Error stream full, report dropped");
        }
        Err(TrySendError::Closed(_)) => {
            debug!("Error stream closed");
        }
    }
}

#[cfg(test)]
mod tests;
