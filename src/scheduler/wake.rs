//! Coalescing wake-up signal between the listener and the scanner.
//!
//! The channel holds at most one pending wake-up. Raising the signal while
//! one is already pending is a no-op, so a burst of notifications costs the
//! scanner a single rescan.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Creates a connected signal/receiver pair.
pub fn wake_channel() -> (WakeSignal, WakeReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (WakeSignal { tx }, WakeReceiver { rx })
}

/// Sending half; cheap to clone.
#[derive(Debug, Clone)]
pub struct WakeSignal {
    tx: mpsc::Sender<()>,
}

impl WakeSignal {
    /// Requests a rescan. Returns false when a wake-up was already pending
    /// or the scanner is gone.
    pub fn notify(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) | Err(TrySendError::Closed(())) => false,
        }
    }
}

/// Receiving half, owned by the scanner.
#[derive(Debug)]
pub struct WakeReceiver {
    rx: mpsc::Receiver<()>,
}

impl WakeReceiver {
    /// Waits for the next wake-up.
    ///
    /// Once every signal has been dropped this never resolves; callers pair
    /// it with a timer or a cancellation token.
    pub async fn wait(&mut self) {
        if self.rx.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }

    /// Consumes a pending wake-up without waiting.
    pub fn try_take(&mut self) -> bool {
        self.rx.try_recv().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_burst_coalesces_into_one_wakeup() {
        let (signal, mut receiver) = wake_channel();

        assert!(signal.notify());
        assert!(!signal.notify());
        assert!(!signal.clone().notify());

        assert!(receiver.try_take());
        assert!(!receiver.try_take());
    }

    #[test]
    fn test_notify_after_receiver_dropped() {
        let (signal, receiver) = wake_channel();
        drop(receiver);
        assert!(!signal.notify());
    }

    #[tokio::test]
    async fn test_wait_returns_after_notify() {
        let (signal, mut receiver) = wake_channel();
        signal.notify();

        tokio::time::timeout(Duration::from_secs(1), receiver.wait())
            .await
            .expect("pending wake-up should be delivered");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_blocks_when_signals_dropped() {
        let (signal, mut receiver) = wake_channel();
        drop(signal);

        let waited = tokio::time::timeout(Duration::from_secs(5), receiver.wait()).await;
        assert!(waited.is_err());
    }
}
