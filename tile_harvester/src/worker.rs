//! The worker pool: each worker pulls a task, fetches it with retry, and
//! hands the result to the sink and ledger.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rand::RngExt;
use reqwest::Client;
use tokio::sync::mpsc;

use crate::ledger::{Ledger, TileStatus};
use crate::provider::Provider;
use crate::sink::Sink;
use crate::task_source::TileTask;

const CHUNK_IDLE_CHECK_EVERY: usize = 1;
const LEDGER_FLUSH_EVERY: u32 = 200;
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// State shared by every worker in a pool. Built once by the controller.
pub struct WorkerContext {
    pub client: Arc<Client>,
    pub provider: Provider,
    pub sink: Arc<dyn Sink>,
    pub ledger: Arc<Ledger>,
    pub retries: u32,
    pub stop: Arc<AtomicBool>,
    pub paused: Arc<AtomicBool>,
    /// Count of tasks the task source has handed out but no worker has yet
    /// reached a terminal outcome for (a re-enqueued, paused-mid-download
    /// task stays counted). Every worker holds a clone of the task
    /// channel's `Sender` (to re-enqueue on pause), so the channel itself
    /// never closes on its own — `in_flight` together with `source_done`
    /// is how a worker recognizes "enumeration is finished and nothing is
    /// left to do" instead.
    pub in_flight: Arc<std::sync::atomic::AtomicU64>,
    pub source_done: Arc<AtomicBool>,
}

/// Builds the shared HTTP client per the pool's resource budget: generous
/// idle-connection reuse since every worker hits a small number of tile
/// hosts repeatedly.
pub fn build_client(user_agent: &str) -> reqwest::Result<Client> {
    Client::builder()
        .user_agent(user_agent)
        .pool_max_idle_per_host(500)
        .pool_idle_timeout(Duration::from_secs(90))
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(10))
        .redirect(reqwest::redirect::Policy::limited(3))
        .no_proxy()
        .build()
}

/// Caps worker count at `min(requested, 4 * cpus, 64)`, floored at 1.
pub fn worker_count(requested: usize) -> usize {
    let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
    requested.min(cpus * 4).min(64).max(1)
}

enum FetchOutcome {
    Success { bytes: Vec<u8> },
    PermanentFailure { reason: String },
    TransientFailure { reason: String },
    Interrupted,
}

async fn fetch_tile(ctx: &WorkerContext, url: &str) -> FetchOutcome {
    let response = match ctx.client.get(url).send().await {
        Ok(r) => r,
        Err(e) => return FetchOutcome::TransientFailure { reason: e.to_string() },
    };

    let status = response.status();
    if status.as_u16() == 403 || status.as_u16() == 404 {
        return FetchOutcome::PermanentFailure {
            reason: format!("http {status}"),
        };
    }
    if !status.is_success() {
        return FetchOutcome::TransientFailure {
            reason: format!("http {status}"),
        };
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    if !content_type.contains("image") {
        return FetchOutcome::TransientFailure {
            reason: format!("non-image content-type: {content_type}"),
        };
    }

    let mut stream = response.bytes_stream();
    let mut data = Vec::new();
    let mut chunks_since_check = 0usize;

    while let Some(chunk) = stream.next().await {
        if ctx.stop.load(Ordering::Relaxed) {
            return FetchOutcome::Interrupted;
        }
        chunks_since_check += 1;
        if chunks_since_check >= CHUNK_IDLE_CHECK_EVERY && ctx.paused.load(Ordering::Relaxed) {
            return FetchOutcome::Interrupted;
        }
        chunks_since_check = 0;

        match chunk {
            Ok(bytes) => data.extend_from_slice(&bytes),
            Err(e) => return FetchOutcome::TransientFailure { reason: e.to_string() },
        }
    }

    if data.is_empty() {
        return FetchOutcome::TransientFailure {
            reason: "empty response body".to_string(),
        };
    }

    FetchOutcome::Success { bytes: data }
}

fn jittered_backoff(attempt: u32) -> Duration {
    let base = Duration::from_millis(200);
    let exp = base * 2u32.saturating_pow(attempt);
    let exp = exp.min(MAX_BACKOFF);
    let jitter = rand::rng().random_range(0.5..1.0);
    exp.mul_f64(jitter)
}

/// Processes a single task end to end: zoom check, existence skip, fetch
/// with retry, sink write, ledger mark. Never returns an error — all
/// outcomes are recorded in the ledger instead.
///
/// `requeue` is the same channel the task came from. A task that gets
/// interrupted mid-download by a pause goes back onto it rather than
/// being dropped, per the re-enqueue-on-pause requirement; every other
/// path here is terminal and decrements `ctx.in_flight` accordingly.
pub(crate) async fn process_task(ctx: &WorkerContext, task: TileTask, requeue: &mpsc::Sender<TileTask>) {
    if !ctx.provider.in_zoom_range(task.z) {
        tracing::warn!(x = task.x, y = task.y, z = task.z, "zoom out of provider range, skipping");
        let _ = ctx.ledger.mark(task.x, task.y, task.z, TileStatus::Skipped, 0).await;
        ctx.in_flight.fetch_sub(1, Ordering::Relaxed);
        return;
    }

    match ctx.sink.already_present(task.x, task.y, task.z).await {
        Ok(true) => {
            let _ = ctx.ledger.mark(task.x, task.y, task.z, TileStatus::Skipped, 0).await;
            ctx.in_flight.fetch_sub(1, Ordering::Relaxed);
            return;
        }
        Ok(false) => {}
        Err(e) => {
            tracing::warn!(error = %e, "sink existence check failed, proceeding with fetch");
        }
    }

    let url = ctx.provider.url_for(task.x, task.y, task.z);
    let mut last_reason = String::new();

    for attempt in 0..ctx.retries {
        if ctx.stop.load(Ordering::Relaxed) {
            ctx.in_flight.fetch_sub(1, Ordering::Relaxed);
            return;
        }
        while ctx.paused.load(Ordering::Relaxed) {
            if ctx.stop.load(Ordering::Relaxed) {
                ctx.in_flight.fetch_sub(1, Ordering::Relaxed);
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        match fetch_tile(ctx, &url).await {
            FetchOutcome::Success { bytes } => {
                let len = bytes.len() as u64;
                // Local I/O failures (mkdir, write, permission) get one
                // retry before being recorded as a per-tile failure, per
                // spec.md §7's "Local I/O ... Retry once after ensuring
                // parent; then mark failed" — a transient condition like a
                // concurrently-removed directory is usually gone a moment
                // later, while a persistent one (disk full, permission
                // denied) fails the same way twice and the run moves on.
                let mut put_result = ctx.sink.put(task.x, task.y, task.z, &bytes).await;
                if let Err(ref e) = put_result {
                    tracing::warn!(x = task.x, y = task.y, z = task.z, error = %e, "sink write failed, retrying once");
                    put_result = ctx.sink.put(task.x, task.y, task.z, &bytes).await;
                }
                if let Err(e) = put_result {
                    tracing::error!(x = task.x, y = task.y, z = task.z, error = %e, "sink write failed after retry");
                    let _ = ctx
                        .ledger
                        .mark(task.x, task.y, task.z, TileStatus::Failed, 0)
                        .await;
                    ctx.in_flight.fetch_sub(1, Ordering::Relaxed);
                    return;
                }
                tracing::debug!(x = task.x, y = task.y, z = task.z, bytes = len, "tile written");
                let _ = ctx
                    .ledger
                    .mark(task.x, task.y, task.z, TileStatus::Success, len)
                    .await;
                ctx.in_flight.fetch_sub(1, Ordering::Relaxed);
                return;
            }
            FetchOutcome::PermanentFailure { reason } => {
                tracing::warn!(x = task.x, y = task.y, z = task.z, reason = %reason, "permanent failure, not retrying");
                let _ = ctx
                    .ledger
                    .mark(task.x, task.y, task.z, TileStatus::Failed, 0)
                    .await;
                ctx.in_flight.fetch_sub(1, Ordering::Relaxed);
                return;
            }
            FetchOutcome::Interrupted => {
                if requeue.send(task).await.is_err() {
                    tracing::warn!(x = task.x, y = task.y, z = task.z, "could not re-enqueue interrupted task, channel closed");
                    ctx.in_flight.fetch_sub(1, Ordering::Relaxed);
                }
                return;
            }
            FetchOutcome::TransientFailure { reason } => {
                last_reason = reason;
                if attempt + 1 < ctx.retries {
                    tokio::time::sleep(jittered_backoff(attempt)).await;
                }
            }
        }
    }

    tracing::warn!(x = task.x, y = task.y, z = task.z, reason = %last_reason, "giving up after exhausting retries");
    let _ = ctx.ledger.mark(task.x, task.y, task.z, TileStatus::Failed, 0).await;
    ctx.in_flight.fetch_sub(1, Ordering::Relaxed);
}

/// Main worker loop, one of `W` sharing a single task queue behind a
/// mutex (an `mpsc::Receiver` has no `resubscribe`, so pulling the next
/// task is the only part that needs to be serialized — processing it
/// isn't). Pulls with a short timeout so it can re-check `stop`/`paused`
/// promptly, re-enqueues a task it pulled mid-pause rather than dropping
/// it, and periodically reports a progress batch.
pub async fn run(
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<TileTask>>>,
    requeue: mpsc::Sender<TileTask>,
    ctx: Arc<WorkerContext>,
    on_batch: impl Fn() + Send,
) {
    let mut processed_since_flush: u32 = 0;

    loop {
        if ctx.stop.load(Ordering::Relaxed) {
            break;
        }

        let next = {
            let mut guard = rx.lock().await;
            tokio::time::timeout(Duration::from_millis(200), guard.recv()).await
        };
        let task = match next {
            Ok(Some(task)) => task,
            Ok(None) => break,
            Err(_) => {
                // Queue was empty for a full tick. If the task source is
                // done enumerating and nothing is still in flight anywhere
                // in the pool, there is no more work coming — the channel
                // itself never closes on its own since every worker holds
                // a requeue `Sender`.
                if ctx.source_done.load(Ordering::Relaxed) && ctx.in_flight.load(Ordering::Relaxed) == 0 {
                    break;
                }
                continue;
            }
        };

        if ctx.paused.load(Ordering::Relaxed) {
            if requeue.send(task).await.is_err() {
                tracing::warn!("could not re-enqueue task on pause, channel closed");
                ctx.in_flight.fetch_sub(1, Ordering::Relaxed);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            continue;
        }

        process_task(&ctx, task, &requeue).await;
        processed_since_flush += 1;
        if processed_since_flush >= LEDGER_FLUSH_EVERY {
            on_batch();
            processed_since_flush = 0;
        }
    }

    if processed_since_flush > 0 {
        on_batch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_count_floors_at_one() {
        assert_eq!(worker_count(0), 1);
    }

    #[test]
    fn worker_count_caps_at_64() {
        assert_eq!(worker_count(10_000), 64);
    }

    #[test]
    fn backoff_never_exceeds_cap() {
        for attempt in 0..20 {
            assert!(jittered_backoff(attempt) <= MAX_BACKOFF);
        }
    }

    #[test]
    fn backoff_grows_with_attempt() {
        let small = jittered_backoff(0);
        let large = jittered_backoff(5);
        assert!(large >= small);
    }
}
