//! Coalescing delayed retry queue
//!
//! Scheduling a key that is already pending is a no-op, so a stack that keeps
//! hitting conflicts never has more than one retry in flight.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// Producer half; cheap to clone
#[derive(Clone)]
pub struct RetryScheduler {
    pending: Arc<Mutex<HashSet<String>>>,
    tx: mpsc::UnboundedSender<String>,
    delay: Duration,
}

/// Consumer half, owned by the reconciler loop
pub struct RetryReceiver {
    pending: Arc<Mutex<HashSet<String>>>,
    rx: mpsc::UnboundedReceiver<String>,
}

pub fn retry_queue(delay: Duration) -> (RetryScheduler, RetryReceiver) {
    let pending = Arc::new(Mutex::new(HashSet::new()));
    let (tx, rx) = mpsc::unbounded_channel();
    (
        RetryScheduler {
            pending: pending.clone(),
            tx,
            delay,
        },
        RetryReceiver { pending, rx },
    )
}

impl RetryScheduler {
    /// Deliver `key` after the retry delay. Returns false when a retry for
    /// the key is already pending.
    pub fn schedule(&self, key: &str) -> bool {
        if !self.pending.lock().insert(key.to_string()) {
            debug!(key, "Retry already pending");
            return false;
        }
        let tx = self.tx.clone();
        let key = key.to_string();
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // receiver gone means the loop is shutting down
            let _ = tx.send(key);
        });
        true
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}

impl RetryReceiver {
    /// Next due key. The key may be scheduled again as soon as it is returned.
    pub async fn recv(&mut self) -> Option<String> {
        let key = self.rx.recv().await?;
        self.pending.lock().remove(&key);
        Some(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_keys_coalesce() {
        let (scheduler, mut receiver) = retry_queue(Duration::from_millis(10));

        assert!(scheduler.schedule("default/app"));
        assert!(!scheduler.schedule("default/app"));
        assert!(scheduler.schedule("default/other"));
        assert_eq!(scheduler.pending(), 2);

        let mut got = vec![receiver.recv().await.unwrap(), receiver.recv().await.unwrap()];
        got.sort();
        assert_eq!(got, vec!["default/app", "default/other"]);
        assert_eq!(scheduler.pending(), 0);

        // nothing else was queued
        let extra = tokio::time::timeout(Duration::from_millis(50), receiver.recv()).await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn test_key_can_be_rescheduled_after_delivery() {
        let (scheduler, mut receiver) = retry_queue(Duration::from_millis(1));
        assert!(scheduler.schedule("default/app"));
        assert_eq!(receiver.recv().await.as_deref(), Some("default/app"));
        assert!(scheduler.schedule("default/app"));
        assert_eq!(receiver.recv().await.as_deref(), Some("default/app"));
    }

    #[test]
    fn test_recv_waits_while_nothing_is_due() {
        let (scheduler, mut receiver) = retry_queue(Duration::from_secs(60));
        let mut next = tokio_test::task::spawn(receiver.recv());
        tokio_test::assert_pending!(next.poll());
        assert_eq!(scheduler.pending(), 0);
    }
}
