//! Countdown barrier used to join worker tasks.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Counts down from N to zero. Every clone shares the same count.
#[derive(Debug, Clone)]
pub struct CompletionBarrier {
    remaining: Arc<watch::Sender<usize>>,
}

impl CompletionBarrier {
    pub fn new(count: usize) -> Self {
        let (remaining, _) = watch::channel(count);
        CompletionBarrier {
            remaining: Arc::new(remaining),
        }
    }

    /// Record one completion. The count stops at zero.
    pub fn signal(&self) {
        self.remaining.send_modify(|remaining| {
            *remaining = remaining.saturating_sub(1);
        });
    }

    pub fn remaining(&self) -> usize {
        *self.remaining.borrow()
    }

    /// A guard that signals once when completed or dropped, so a worker that
    /// errors out or panics still counts down.
    pub fn guard(&self) -> CompletionGuard {
        CompletionGuard {
            barrier: Some(self.clone()),
        }
    }

    /// Wait until the count reaches zero.
    pub async fn wait(&self) {
        let mut remaining = self.remaining.subscribe();
        // the sender lives in self, so this cannot fail
        let _ = remaining.wait_for(|remaining| *remaining == 0).await;
    }

    /// Wait for the count to reach zero for at most `timeout`.
    /// Returns false if the timeout elapsed first.
    pub async fn await_all(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}

#[derive(Debug)]
pub struct CompletionGuard {
    barrier: Option<CompletionBarrier>,
}

impl CompletionGuard {
    pub fn complete(mut self) {
        if let Some(barrier) = self.barrier.take() {
            barrier.signal();
        }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if let Some(barrier) = self.barrier.take() {
            barrier.signal();
        }
    }
}
