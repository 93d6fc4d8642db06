//! Per-pass progress accounting

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Counters the executor updates while applying the sorted operation list
#[derive(Debug, Default)]
pub struct ProgressInfo {
    total_ops: AtomicUsize,
    completed_ops: AtomicUsize,
    bytes_transferred: AtomicU64,
}

impl ProgressInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_pass(&self, total_ops: usize) {
        self.total_ops.store(total_ops, Ordering::Relaxed);
        self.completed_ops.store(0, Ordering::Relaxed);
        self.bytes_transferred.store(0, Ordering::Relaxed);
    }

    pub fn op_done(&self) {
        self.completed_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (usize, usize, u64) {
        (
            self.completed_ops.load(Ordering::Relaxed),
            self.total_ops.load(Ordering::Relaxed),
            self.bytes_transferred.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let progress = ProgressInfo::new();
        progress.begin_pass(3);
        progress.op_done();
        progress.op_done();
        progress.add_bytes(512);

        let (done, total, bytes) = progress.snapshot();
        assert_eq!(done, 2);
        assert_eq!(total, 3);
        assert_eq!(bytes, 512);

        progress.begin_pass(1);
        assert_eq!(progress.snapshot(), (0, 1, 0));
    }
}
