//! Notification listener.
//!
//! Holds a dedicated connection that LISTENs on the task channel and turns
//! every notification into a (coalesced) wake-up for the scanner. When the
//! connection drops, sqlx reconnects and re-subscribes on the next receive;
//! notifications sent in between are lost, so the listener also raises a
//! wake-up to force a rescan.

use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};

use crate::error::SchedulerError;
use crate::storage::Channel;

use super::backoff::{Backoff, BackoffConfig};
use super::wake::WakeSignal;

pub struct NotificationListener {
    listener: PgListener,
    channel: Channel,
    wake: WakeSignal,
    backoff: Backoff,
    shutdown: CancellationToken,
}

impl NotificationListener {
    /// Opens the listening connection and subscribes to `channel`.
    pub async fn connect(
        pool: &PgPool,
        channel: Channel,
        wake: WakeSignal,
        backoff: BackoffConfig,
        shutdown: CancellationToken,
    ) -> Result<Self, SchedulerError> {
        let mut listener = PgListener::connect_with(pool).await?;
        listener
            .listen(channel.as_str())
            .await
            .map_err(|source| SchedulerError::Listen {
                channel: channel.to_string(),
                source,
            })?;

        info!(channel = %channel, "Listening for task notifications");

        Ok(Self {
            listener,
            channel,
            wake,
            backoff: Backoff::new(backoff),
            shutdown,
        })
    }

    /// Forwards notifications until shutdown.
    pub async fn run(mut self) {
        loop {
            let received = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = self.listener.try_recv() => received,
            };

            match received {
                Ok(Some(notification)) => {
                    trace!(channel = %notification.channel(), "Received notification");
                    self.backoff.reset();
                    self.wake.notify();
                }
                Ok(None) => {
                    warn!(
                        channel = %self.channel,
                        "Notification connection lost; reconnecting and rescanning"
                    );
                    self.wake.notify();
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    error!(
                        channel = %self.channel,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Notification listener failed"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    // Anything published while we were down was missed.
                    self.wake.notify();
                }
            }
        }

        info!(channel = %self.channel, "Notification listener stopped");
    }
}
