use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::watch;

/// One-shot latch. `fire` flips it at most once; waiters observe it forever after.
#[derive(Debug)]
pub struct CompletionLatch {
    fired: AtomicBool,
    tx: watch::Sender<bool>,
}

impl CompletionLatch {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            fired: AtomicBool::new(false),
            tx,
        }
    }

    /// Returns true only for the call that actually fired the latch.
    pub fn fire(&self) -> bool {
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.tx.send_replace(true);
        true
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Resolves once the latch has fired, immediately if it already has.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

impl Default for CompletionLatch {
    fn default() -> Self {
        Self::new()
    }
}

/// ReceivedCount plus the configured target (0 = unlimited).
#[derive(Debug)]
pub struct ReceivedCounter {
    received: AtomicU64,
    target: u64,
    completion: CompletionLatch,
}

impl ReceivedCounter {
    pub fn new(target: u64) -> Self {
        Self {
            received: AtomicU64::new(0),
            target,
            completion: CompletionLatch::new(),
        }
    }

    /// Count one processed message. Returns the new total.
    pub fn increment(&self) -> u64 {
        let received = self.received.fetch_add(1, Ordering::AcqRel) + 1;
        if self.target != 0 && received >= self.target && self.completion.fire() {
            tracing::info!(received, target = self.target, "target message count reached");
        }
        received
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Acquire)
    }

    pub fn target(&self) -> u64 {
        self.target
    }

    pub fn completion(&self) -> &CompletionLatch {
        &self.completion
    }
}
