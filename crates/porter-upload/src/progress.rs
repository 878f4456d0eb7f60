use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchProgress {
    pub completed_bytes: u64,
    pub total_bytes: u64,
}

pub type ProgressHandler = Arc<dyn Fn(BatchProgress) + Send + Sync>;

/// Bytes the server has accepted across every file of a job.
pub(crate) struct ProgressCounter {
    completed: AtomicU64,
    total: u64,
    handler: Option<ProgressHandler>,
}

impl ProgressCounter {
    pub(crate) fn new(total: u64, handler: Option<ProgressHandler>) -> Self {
        Self {
            completed: AtomicU64::new(0),
            total,
            handler,
        }
    }

    /// Count a chunk the server accepted.
    pub(crate) fn record(&self, bytes: u64) {
        let completed = self.completed.fetch_add(bytes, Ordering::AcqRel) + bytes;
        if let Some(handler) = &self.handler {
            handler(BatchProgress {
                completed_bytes: completed,
                total_bytes: self.total,
            });
        }
    }

    pub(crate) fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn reports_running_total() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let counter = ProgressCounter::new(
            30,
            Some(Arc::new(move |p: BatchProgress| sink.lock().push(p.completed_bytes))),
        );
        counter.record(10);
        counter.record(20);
        assert_eq!(*seen.lock(), vec![10, 30]);
        assert_eq!(counter.completed(), 30);
    }
}
