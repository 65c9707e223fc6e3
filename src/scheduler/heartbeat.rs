//! Lease renewal for in-flight tasks.
//!
//! A heartbeat runs beside every handler. It renews the lease on the pool,
//! outside the execution transaction, so renewals take effect while the
//! handler's own writes are still uncommitted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::TaskError;
use crate::storage::TaskStore;

use super::config::LeaseSettings;
use super::task::{TaskId, WorkerId};

/// Something that can extend a worker's lease on a task.
#[async_trait]
pub trait LeaseKeeper: Send + Sync + 'static {
    /// Extends the lease by `lease`; false when it is no longer held.
    async fn renew(
        &self,
        task_id: TaskId,
        worker_id: &WorkerId,
        lease: Duration,
    ) -> Result<bool, TaskError>;
}

#[async_trait]
impl LeaseKeeper for TaskStore {
    async fn renew(
        &self,
        task_id: TaskId,
        worker_id: &WorkerId,
        lease: Duration,
    ) -> Result<bool, TaskError> {
        self.renew_lease(task_id, worker_id, lease).await
    }
}

/// Handle to a running heartbeat.
pub struct Heartbeat {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    /// Starts renewing the lease every `settings.heartbeat_interval`.
    ///
    /// Scheduler shutdown does not stop the heartbeat: the handler it
    /// protects is allowed to finish, and keeps its lease until `stop`.
    pub fn start<K: LeaseKeeper>(
        keeper: Arc<K>,
        task_id: TaskId,
        worker_id: WorkerId,
        settings: LeaseSettings,
    ) -> Self {
        let token = CancellationToken::new();
        let handle = tokio::spawn(run(keeper, task_id, worker_id, settings, token.clone()));
        Self { token, handle }
    }

    /// Stops renewing and waits for the loop to exit.
    ///
    /// Once this returns no renewal is in flight, so the caller's final
    /// status write cannot race one.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            error!(error = %e, "Heartbeat task panicked");
        }
    }
}

async fn run<K: LeaseKeeper>(
    keeper: Arc<K>,
    task_id: TaskId,
    worker_id: WorkerId,
    settings: LeaseSettings,
    token: CancellationToken,
) {
    let interval = settings.heartbeat_interval;
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match keeper.renew(task_id, &worker_id, settings.duration).await {
            Ok(true) => {
                debug!(task_id = %task_id, worker_id = %worker_id, "Renewed lease");
            }
            Ok(false) => {
                warn!(
                    task_id = %task_id,
                    worker_id = %worker_id,
                    "Lease lost; another worker may have claimed the task"
                );
            }
            Err(e) => {
                warn!(
                    task_id = %task_id,
                    worker_id = %worker_id,
                    error = %e,
                    "Failed to renew lease"
                );
            }
        }
    }
}
