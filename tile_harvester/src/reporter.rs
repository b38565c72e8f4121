//! Delivers periodic progress snapshots to whoever is watching a run,
//! without putting reporting on the critical path of any worker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use crate::ledger::LedgerCounts;

/// A point-in-time view of run progress. `completed` is `true` exactly
/// once, on the final snapshot sent after the last worker exits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub downloaded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub total_bytes: u64,
    pub total_tasks: u64,
    pub completed: bool,
}

impl ProgressSnapshot {
    pub fn processed(&self) -> u64 {
        self.downloaded + self.failed + self.skipped
    }
}

/// Tracks `total_tasks` (grows as the task source enumerates) and
/// publishes snapshots over a `tokio::sync::watch` channel: subscribers
/// only ever see the latest value, so a slow subscriber can never make a
/// worker block on progress delivery.
pub struct ProgressReporter {
    ledger_counts: Arc<LedgerCounts>,
    total_tasks: Arc<AtomicU64>,
    tx: watch::Sender<ProgressSnapshot>,
}

impl ProgressReporter {
    pub fn new(ledger_counts: Arc<LedgerCounts>, total_tasks: Arc<AtomicU64>) -> (Self, watch::Receiver<ProgressSnapshot>) {
        let (tx, rx) = watch::channel(ProgressSnapshot {
            downloaded: 0,
            failed: 0,
            skipped: 0,
            total_bytes: 0,
            total_tasks: 0,
            completed: false,
        });
        (
            ProgressReporter {
                ledger_counts,
                total_tasks,
                tx,
            },
            rx,
        )
    }

    fn snapshot(&self, completed: bool) -> ProgressSnapshot {
        let (downloaded, failed, skipped, total_bytes) = self.ledger_counts.snapshot();
        ProgressSnapshot {
            downloaded,
            failed,
            skipped,
            total_bytes,
            total_tasks: self.total_tasks.load(Ordering::Relaxed),
            completed,
        }
    }

    pub fn publish(&self) {
        let _ = self.tx.send(self.snapshot(false));
    }

    /// Sent once, after the worker pool has drained and the task source has
    /// finished enumerating (or the run was cancelled).
    pub fn publish_final(&self) {
        let _ = self.tx.send(self.snapshot(true));
    }

    /// Runs until `stop` fires, publishing a snapshot every `interval`.
    /// Workers publish their own snapshots on notable transitions (a batch
    /// flush, a pause/resume); this loop exists so a slow run still shows
    /// visible progress between those events.
    pub async fn run_periodic(&self, interval: std::time::Duration, mut stop: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.publish(),
                _ = stop.changed() => {
                    if *stop.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_ledger_counts() {
        let counts = Arc::new(LedgerCounts::default());
        counts.downloaded.store(3, Ordering::Relaxed);
        counts.failed.store(1, Ordering::Relaxed);
        counts.total_bytes.store(2048, Ordering::Relaxed);
        let total_tasks = Arc::new(AtomicU64::new(10));

        let (reporter, rx) = ProgressReporter::new(counts, total_tasks);
        reporter.publish();
        let snap = *rx.borrow();
        assert_eq!(snap.downloaded, 3);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.processed(), 4);
        assert_eq!(snap.total_tasks, 10);
        assert!(!snap.completed);
    }

    #[test]
    fn final_snapshot_marks_completed() {
        let counts = Arc::new(LedgerCounts::default());
        let total_tasks = Arc::new(AtomicU64::new(5));
        let (reporter, rx) = ProgressReporter::new(counts, total_tasks);
        reporter.publish_final();
        assert!(rx.borrow().completed);
    }
}
