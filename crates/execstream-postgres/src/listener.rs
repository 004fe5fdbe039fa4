//! Change listeners
//!
//! A listener owns one notification connection for its whole lifetime and
//! yields decoded envelopes one at a time. `wait_next` is the pipeline's only
//! blocking point; it always wakes on cancellation.

use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgPool};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::envelope::Envelope;
use crate::error::ListenError;

/// Source of decoded change notifications
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChangeListener: Send + 'static {
    /// Wait for the next notification.
    ///
    /// Returns [`ListenError::Cancelled`] once `cancel` fires. A
    /// [`ListenError::Decode`] affects only that notification and the
    /// listener stays usable.
    async fn wait_next(&mut self, cancel: &CancellationToken) -> Result<Envelope, ListenError>;

    /// Give the underlying connection back
    async fn release(self);
}

/// Listener on a dedicated Postgres `LISTEN` connection
pub struct PgChangeListener {
    listener: PgListener,
    channel: String,
}

impl PgChangeListener {
    /// Take a connection from `pool` and `LISTEN` on `channel`
    #[instrument(skip(pool))]
    pub async fn connect(pool: &PgPool, channel: &str) -> Result<Self, ListenError> {
        let mut listener = PgListener::connect_with(pool)
            .await
            .map_err(|e| ListenError::Database(e.to_string()))?;
        listener
            .listen(channel)
            .await
            .map_err(|e| ListenError::Database(e.to_string()))?;

        info!(channel, "Notification connection acquired");
        Ok(Self {
            listener,
            channel: channel.to_string(),
        })
    }

    /// Channel this listener is subscribed to
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl ChangeListener for PgChangeListener {
    async fn wait_next(&mut self, cancel: &CancellationToken) -> Result<Envelope, ListenError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ListenError::Cancelled),
            received = self.listener.try_recv() => match received {
                Ok(Some(notification)) => Envelope::decode(notification.payload()),
                // No reconnect: the caller decides whether to build a new source.
                Ok(None) => Err(ListenError::ConnectionLost),
                Err(e) => Err(ListenError::Database(e.to_string())),
            },
        }
    }

    async fn release(mut self) {
        if let Err(e) = self.listener.unlisten_all().await {
            warn!(channel = %self.channel, error = %e, "UNLISTEN failed during release");
        }
        info!(channel = %self.channel, "Notification connection released");
    }
}

/// Listener over raw payloads delivered in-process
///
/// Pairs with [`MemoryRepository::with_notifier`]. A closed channel reads as
/// a lost connection.
///
/// [`MemoryRepository::with_notifier`]: execstream_core::MemoryRepository::with_notifier
pub struct ChannelListener {
    rx: mpsc::UnboundedReceiver<String>,
}

impl ChannelListener {
    /// Wrap a payload receiver
    #[must_use]
    pub fn new(rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self { rx }
    }

    /// Create a connected sender and listener
    #[must_use]
    pub fn channel() -> (mpsc::UnboundedSender<String>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl ChangeListener for ChannelListener {
    async fn wait_next(&mut self, cancel: &CancellationToken) -> Result<Envelope, ListenError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ListenError::Cancelled),
            payload = self.rx.recv() => match payload {
                Some(payload) => Envelope::decode(&payload),
                None => Err(ListenError::ConnectionLost),
            },
        }
    }

    async fn release(mut self) {
        self.rx.close();
        debug!("Channel listener released");
    }
}
