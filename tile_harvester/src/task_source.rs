//! Streams `(x, y, z)` tasks from a bounding box across a zoom range into a
//! bounded channel, skipping anything the ledger already has recorded.
//!
//! Enumeration never materializes the full tile list: it walks
//! [`crate::tile_math::TileRange`] zoom by zoom and yields into a bounded
//! `mpsc` channel, so a multi-million-tile job holds only a handful of
//! pending tasks in memory at any moment.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::ledger::Ledger;
use crate::tile_math::tiles_in_bbox;

#[derive(Debug, Clone, Copy)]
pub struct TileTask {
    pub x: u32,
    pub y: u32,
    pub z: u8,
}

/// Shared counters the controller/reporter read without touching the
/// channel: total tiles the source has emitted or decided to skip so far.
#[derive(Debug, Default)]
pub struct TaskSourceStats {
    pub emitted: AtomicU64,
    pub skipped: AtomicU64,
}

/// Drives enumeration of a single bbox across a zoom range into `tx`.
/// Built fresh per `enqueue_bbox` call; `run` consumes it.
pub struct TaskSource {
    west: f64,
    south: f64,
    east: f64,
    north: f64,
    min_zoom: u8,
    max_zoom: u8,
    tms: bool,
    ledger: Arc<Ledger>,
    stats: Arc<TaskSourceStats>,
}

impl TaskSource {
    pub fn new(
        west: f64,
        south: f64,
        east: f64,
        north: f64,
        min_zoom: u8,
        max_zoom: u8,
        tms: bool,
        ledger: Arc<Ledger>,
        stats: Arc<TaskSourceStats>,
    ) -> Self {
        TaskSource {
            west,
            south,
            east,
            north,
            min_zoom,
            max_zoom,
            tms,
            ledger,
            stats,
        }
    }

    /// Feeds `tx` until the bbox is fully enumerated, `cancel` is set, or
    /// the receiver is dropped. Honors `pause` by blocking enumeration
    /// (not just delivery) so a paused run doesn't race ahead filling the
    /// channel buffer with tasks nobody is ready to drain.
    /// `total_tasks` grows live as tiles are enumerated (one per tile
    /// considered, skipped or not) rather than being computed up front
    /// from the bbox's closed-form area, so an operator watching a
    /// billion-tile job sees the target climb instead of appearing frozen
    /// during initial enumeration.
    /// `in_flight` is incremented once per tile actually handed to a
    /// worker (not for ledger-skipped tiles, which never enter the
    /// channel) and `source_done` is set exactly once, after the last exit
    /// point of this function (cancelled, receiver dropped, or bbox fully
    /// enumerated). Workers use the pair to detect "no more work will ever
    /// arrive" without relying on the channel itself closing — every
    /// worker holds its own clone of `tx` for re-enqueueing paused tasks,
    /// so the channel never closes on its own while any worker is alive.
    pub async fn run(
        self,
        tx: mpsc::Sender<TileTask>,
        cancel: Arc<AtomicBool>,
        paused: Arc<AtomicBool>,
        total_tasks: Arc<AtomicU64>,
        in_flight: Arc<AtomicU64>,
        source_done: Arc<AtomicBool>,
    ) {
        'enumerate: for z in self.min_zoom..=self.max_zoom {
            let range = tiles_in_bbox(self.west, self.south, self.east, self.north, z, self.tms);
            let batch_size = sub_batch_size(range.len());
            tracing::info!(zoom = z, count = range.len(), batch_size, "enumerating zoom level");

            let mut since_yield: usize = 0;
            for (x, y) in range {
                if cancel.load(Ordering::Relaxed) {
                    tracing::info!("enumeration cancelled");
                    break 'enumerate;
                }

                while paused.load(Ordering::Relaxed) {
                    if cancel.load(Ordering::Relaxed) {
                        break 'enumerate;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }

                let already_done = match self.ledger.contains(x, y, z).await {
                    Ok(done) => done,
                    Err(e) => {
                        tracing::warn!(error = %e, "ledger membership check failed, treating tile as unprocessed");
                        false
                    }
                };
                if already_done {
                    self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                    total_tasks.fetch_add(1, Ordering::Relaxed);
                } else {
                    in_flight.fetch_add(1, Ordering::Relaxed);
                    if tx.send(TileTask { x, y, z }).await.is_err() {
                        tracing::info!("task receiver dropped, stopping enumeration");
                        in_flight.fetch_sub(1, Ordering::Relaxed);
                        break 'enumerate;
                    }
                    self.stats.emitted.fetch_add(1, Ordering::Relaxed);
                    total_tasks.fetch_add(1, Ordering::Relaxed);
                }

                // A long run of ledger-hit tiles (e.g. resuming a zoom
                // that's already fully done) never awaits on the channel,
                // so yield explicitly every `batch_size` tiles: otherwise
                // enumeration could monopolize its executor thread for a
                // z=16+ world box and starve the worker pool of pause/cancel
                // responsiveness and progress delivery.
                since_yield += 1;
                if since_yield >= batch_size {
                    since_yield = 0;
                    tokio::task::yield_now().await;
                }
            }
        }
        source_done.store(true, Ordering::Relaxed);
    }
}

/// Sub-batch size between enumeration yield points: the spec's default of
/// 10,000, automatically reduced to 1,000 once a single zoom level's tile
/// count exceeds ~10^6, so a huge zoom still yields often enough for a
/// pause/cancel to be observed promptly.
fn sub_batch_size(zoom_tile_count: u64) -> usize {
    if zoom_tile_count > 1_000_000 { 1_000 } else { 10_000 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;

    #[test]
    fn sub_batch_size_shrinks_for_huge_zooms() {
        assert_eq!(sub_batch_size(100), 10_000);
        assert_eq!(sub_batch_size(1_000_001), 1_000);
    }

    #[tokio::test]
    async fn enumerates_and_skips_ledger_hits() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(Ledger::open(&dir.path().join("p.db"), "hash").await.unwrap());
        ledger.mark(0, 0, 1, crate::ledger::TileStatus::Success, 1).await.unwrap();
        ledger.load_for_range(0, 1).await.unwrap();

        let stats = Arc::new(TaskSourceStats::default());
        let source = TaskSource::new(-180.0, -85.0, 180.0, 85.0, 0, 1, false, ledger, stats.clone());

        let (tx, mut rx) = mpsc::channel(16);
        let cancel = Arc::new(AtomicBool::new(false));
        let paused = Arc::new(AtomicBool::new(false));
        let total_tasks = Arc::new(AtomicU64::new(0));
        let in_flight = Arc::new(AtomicU64::new(0));
        let source_done = Arc::new(AtomicBool::new(false));

        let handle = tokio::spawn(source.run(
            tx,
            cancel,
            paused,
            total_tasks.clone(),
            in_flight.clone(),
            source_done.clone(),
        ));

        let mut seen = Vec::new();
        while let Some(task) = rx.recv().await {
            seen.push((task.x, task.y, task.z));
        }
        handle.await.unwrap();

        // z=0 has 1 tile, z=1 has 4 tiles, one of which is pre-marked.
        assert_eq!(seen.len(), 4);
        assert!(!seen.contains(&(0, 0, 1)));
        assert_eq!(stats.skipped.load(Ordering::Relaxed), 1);
        assert_eq!(stats.emitted.load(Ordering::Relaxed), 4);
        assert_eq!(total_tasks.load(Ordering::Relaxed), 5);
        assert_eq!(in_flight.load(Ordering::Relaxed), 4);
        assert!(source_done.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn cancel_stops_enumeration_early() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(Ledger::open(&dir.path().join("p.db"), "hash").await.unwrap());
        let stats = Arc::new(TaskSourceStats::default());
        let source = TaskSource::new(-180.0, -85.0, 180.0, 85.0, 0, 10, false, ledger, stats);

        let (tx, mut rx) = mpsc::channel(1);
        let cancel = Arc::new(AtomicBool::new(false));
        let paused = Arc::new(AtomicBool::new(false));
        let total_tasks = Arc::new(AtomicU64::new(0));
        let in_flight = Arc::new(AtomicU64::new(0));
        let source_done = Arc::new(AtomicBool::new(false));

        let cancel_clone = cancel.clone();
        let handle = tokio::spawn(source.run(
            tx,
            cancel_clone,
            paused,
            total_tasks,
            in_flight,
            source_done.clone(),
        ));
        let _first = rx.recv().await;
        cancel.store(true, Ordering::Relaxed);
        drop(rx);
        handle.await.unwrap();
        assert!(source_done.load(Ordering::Relaxed));
    }
}
