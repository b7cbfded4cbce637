//! Fire-once signals shared between session tasks

use std::sync::Arc;
use tokio::sync::watch;

/// A latch that can be fired once and awaited by any number of tasks.
///
/// Used for the engine-wide stop signal, the per-session completion token
/// and the "all peers finished" notification.
#[derive(Debug, Clone)]
pub struct Signal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Signal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn fire(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_fired(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal has fired
    pub async fn fired(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_signal_wakes_waiters() {
        let signal = Signal::new();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.fired().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!signal.is_fired());
        signal.fire();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        // already fired resolves immediately
        signal.fired().await;
        signal.fire();
        assert!(signal.is_fired());
    }
}
