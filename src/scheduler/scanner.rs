//! The scanner: claims tasks and dispatches them to idle workers.
//!
//! One scanner runs per scheduler. It waits for an idle worker, claims the
//! oldest eligible task on that worker's behalf and hands it over, then
//! immediately scans again. Only when a scan finds nothing does it park the
//! idle worker and block until a wake-up (or the fallback rescan timer).
//!
//! ```text
//!   available ──► [slot] ──► claim ──► Claimed ──► inbox of that worker
//!                              │
//!                              ├─► Empty     ──► park slot, wait for wake-up
//!                              ├─► Contended ──► rescan now
//!                              └─► Err       ──► back off, rescan
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::TaskError;
use crate::storage::TaskStore;

use super::backoff::{Backoff, BackoffConfig};
use super::registry::Registry;
use super::task::{ClaimOutcome, ClaimedTask, TaskResult, WorkerId};
use super::wake::WakeReceiver;
use super::worker_pool::{Assignment, WorkerSlot};

/// Where the scanner claims tasks from.
#[async_trait]
pub trait ClaimSource: Send + Sync + 'static {
    /// Leases one eligible task of `task_types` to `worker_id`.
    async fn claim(
        &self,
        task_types: &[String],
        worker_id: &WorkerId,
        lease: Duration,
    ) -> Result<ClaimOutcome, TaskError>;

    /// Fails a claimed task that no handler can run.
    async fn fail_unhandled(&self, task: &ClaimedTask, message: &str) -> Result<(), TaskError>;
}

#[async_trait]
impl ClaimSource for TaskStore {
    async fn claim(
        &self,
        task_types: &[String],
        worker_id: &WorkerId,
        lease: Duration,
    ) -> Result<ClaimOutcome, TaskError> {
        TaskStore::claim(self, task_types, worker_id, lease).await
    }

    async fn fail_unhandled(&self, task: &ClaimedTask, message: &str) -> Result<(), TaskError> {
        self.finish(task, &TaskResult::failed(message)).await?;
        Ok(())
    }
}

/// Error recorded on a claimed task whose type has no handler.
///
/// The type is quoted with Rust's `Debug` formatting for `str`, so quotes,
/// backslashes and control characters are escaped as Rust string literals
/// would show them (`\n`, `\u{1b}`).
pub fn unhandled_type_message(task_type: &str) -> String {
    format!("no handler registered for task type {:?}", task_type)
}

enum ScanOutcome {
    /// The task went to the slot's worker.
    Dispatched,
    /// Nothing to do; the slot is still idle.
    Idle(WorkerSlot),
    /// Scan again straight away with the same slot.
    Again(WorkerSlot),
}

pub struct Scanner<S> {
    source: Arc<S>,
    registry: Arc<Registry>,
    available: mpsc::Receiver<WorkerSlot>,
    wake: WakeReceiver,
    lease: Duration,
    fallback_rescan: Option<Duration>,
    backoff: Backoff,
    shutdown: CancellationToken,
}

impl<S: ClaimSource> Scanner<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<S>,
        registry: Arc<Registry>,
        available: mpsc::Receiver<WorkerSlot>,
        wake: WakeReceiver,
        lease: Duration,
        fallback_rescan: Option<Duration>,
        backoff: BackoffConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            source,
            registry,
            available,
            wake,
            lease,
            fallback_rescan,
            backoff: Backoff::new(backoff),
            shutdown,
        }
    }

    /// Main scanner loop; returns on shutdown.
    pub async fn run(mut self) {
        info!("Scanner started");

        let mut idle: Option<WorkerSlot> = None;
        let mut need_scan = true;

        loop {
            if !need_scan {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = self.wake.wait() => {}
                    _ = sleep_or_forever(self.fallback_rescan) => {
                        debug!("Fallback rescan");
                    }
                }
                need_scan = true;
                continue;
            }

            let slot = match idle.take() {
                Some(slot) => slot,
                None => {
                    let slot = tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        slot = self.available.recv() => slot,
                    };
                    match slot {
                        Some(slot) => slot,
                        None => break,
                    }
                }
            };

            // A wake-up raised before this scan is covered by it.
            self.wake.try_take();

            match self.scan(slot).await {
                Ok(ScanOutcome::Dispatched) => self.backoff.reset(),
                Ok(ScanOutcome::Again(slot)) => {
                    self.backoff.reset();
                    idle = Some(slot);
                }
                Ok(ScanOutcome::Idle(slot)) => {
                    self.backoff.reset();
                    idle = Some(slot);
                    need_scan = false;
                }
                Err((slot, e)) => {
                    idle = Some(slot);
                    let delay = self.backoff.next_delay();
                    warn!(
                        error = %e,
                        failures = self.backoff.failures(),
                        retry_in_ms = delay.as_millis() as u64,
                        "Scan failed, backing off"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        info!("Scanner stopped");
    }

    async fn scan(&self, slot: WorkerSlot) -> Result<ScanOutcome, (WorkerSlot, TaskError)> {
        let types = self.registry.types();

        let task = match self.source.claim(&types, &slot.worker_id, self.lease).await {
            Ok(ClaimOutcome::Claimed(task)) => task,
            Ok(ClaimOutcome::Empty) => return Ok(ScanOutcome::Idle(slot)),
            Ok(ClaimOutcome::Contended) => return Ok(ScanOutcome::Again(slot)),
            Err(e) => return Err((slot, e)),
        };

        let Some(handler) = self.registry.get(&task.task_type) else {
            let message = unhandled_type_message(&task.task_type);
            warn!(task_id = %task.id, task_type = %task.task_type, "Claimed task has no handler");
            if let Err(e) = self.source.fail_unhandled(&task, &message).await {
                // The lease will expire and the task be claimed again.
                error!(task_id = %task.id, error = %e, "Failed to fail unhandled task");
            }
            return Ok(ScanOutcome::Again(slot));
        };

        debug!(task_id = %task.id, worker_id = %slot.worker_id, "Dispatching task");
        let task_id = task.id;
        if slot.inbox.send(Assignment { task, handler }).await.is_err() {
            warn!(
                task_id = %task_id,
                worker_id = %slot.worker_id,
                "Worker exited before taking its task; it will be reclaimed after its lease expires"
            );
        }
        Ok(ScanOutcome::Dispatched)
    }
}

async fn sleep_or_forever(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}
