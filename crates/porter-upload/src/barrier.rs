use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

/// Counts outstanding workers; [`JoinCounter::wait`] returns once every
/// worker has left.
#[derive(Debug)]
pub struct JoinCounter {
    remaining: AtomicUsize,
    done: Notify,
}

impl JoinCounter {
    pub fn new(workers: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(workers),
            done: Notify::new(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn leave(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.done.notify_waiters();
        }
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.done.notified();
            tokio::pin!(notified);
            // register before checking so a concurrent leave cannot be missed
            notified.as_mut().enable();
            if self.remaining() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Leaves when dropped, so a panicking worker still releases the barrier.
    pub fn guard(self: &Arc<Self>) -> LeaveGuard {
        LeaveGuard {
            counter: self.clone(),
        }
    }
}

pub struct LeaveGuard {
    counter: Arc<JoinCounter>,
}

impl Drop for LeaveGuard {
    fn drop(&mut self) {
        self.counter.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn zero_workers_returns_immediately() {
        JoinCounter::new(0).wait().await;
    }

    #[tokio::test]
    async fn waits_for_every_worker() {
        let counter = Arc::new(JoinCounter::new(3));
        for delay in [5u64, 15, 25] {
            let guard = counter.guard();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                drop(guard);
            });
        }
        tokio::time::timeout(Duration::from_secs(5), counter.wait())
            .await
            .unwrap();
        assert_eq!(counter.remaining(), 0);
    }

    #[tokio::test]
    async fn panicking_worker_still_leaves() {
        let counter = Arc::new(JoinCounter::new(1));
        let guard = counter.guard();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            panic!("worker failed");
        });
        assert!(handle.await.is_err());
        tokio::time::timeout(Duration::from_secs(5), counter.wait())
            .await
            .unwrap();
    }
}
