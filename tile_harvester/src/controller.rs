//! Orchestrates one harvest run: builds the provider, ledger, and sink from
//! a [`RunConfig`], then drives the task source and worker pool to
//! completion while exposing the pause/resume/cancel/statistics seam an
//! external front-end would call.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::config::{RunConfig, SinkKind};
use crate::error::{HarvestError, Result};
use crate::ledger::Ledger;
use crate::provider::Provider;
use crate::reporter::{ProgressReporter, ProgressSnapshot};
use crate::sink::{FsSink, MbtilesSink, ShardedMbtilesSink, Sink};
use crate::task_source::{TaskSource, TaskSourceStats};
use crate::worker::{self, WorkerContext};

const TASK_CHANNEL_CAPACITY: usize = 10_000;

/// Lifecycle states a run moves through. There is no transition back from
/// a terminal state (`Completed`/`Cancelled`/`Failed`); a new run needs a
/// new `Controller`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

struct SharedState {
    stop: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    total_tasks: Arc<AtomicU64>,
    in_flight: Arc<AtomicU64>,
    source_done: Arc<AtomicBool>,
    run_state: std::sync::Mutex<RunState>,
    /// Set the instant `Controller::run` is entered. The signal trap
    /// consults this to decide the process exit status: per spec.md §6,
    /// a shutdown signal exits 0 if a run had actually started, non-zero
    /// otherwise (e.g. a signal arriving while still constructing
    /// collaborators, with nothing yet to cooperatively flush).
    run_started: Arc<AtomicBool>,
}

pub struct Controller {
    config: RunConfig,
    provider: Provider,
    ledger: Arc<Ledger>,
    sink: Arc<dyn Sink>,
    client: Arc<reqwest::Client>,
    shared: Arc<SharedState>,
    reporter: Arc<ProgressReporter>,
    progress_rx: watch::Receiver<ProgressSnapshot>,
}

fn resolve_provider(config: &RunConfig) -> Result<Provider> {
    let provider = match config.provider_name.as_str() {
        "osm" => Provider::osm(),
        "bing" => Provider::bing(),
        _ => Provider::custom(
            config.provider_name.clone(),
            config.url_template.clone(),
            config.subdomains.clone(),
            config.min_zoom,
            config.max_zoom,
        )?,
    };
    Ok(provider.with_tms(config.is_tms))
}

fn aux_dir(config: &RunConfig) -> PathBuf {
    let output = PathBuf::from(&config.output_path);
    match config.sink_kind {
        SinkKind::Directory => output.join("aux"),
        SinkKind::Mbtiles => output
            .parent()
            .map(|p| p.join("aux"))
            .unwrap_or_else(|| PathBuf::from("aux")),
    }
}

impl Controller {
    /// Builds every collaborator a run needs and registers the OS signal
    /// trap that turns SIGINT/SIGTERM into a cooperative cancel.
    pub async fn new(config: RunConfig) -> Result<Self> {
        let provider = resolve_provider(&config)?;

        let aux = aux_dir(&config);
        tokio::fs::create_dir_all(&aux)
            .await
            .map_err(|e| HarvestError::Fatal(format!("failed to create data directory {}: {e}", aux.display())))?;
        let ledger_path = aux.join(format!("{}_progress.db", config.provider_name));
        let ledger = Arc::new(Ledger::open(&ledger_path, &config.config_hash()).await?);

        let sink: Arc<dyn Sink> = match &config.sink_kind {
            SinkKind::Directory => {
                Arc::new(FsSink::open(std::path::Path::new(&config.output_path), provider.clone()).await?)
            }
            // Sharding isn't an independent knob: per spec.md §4.D, a
            // zoom-sharded MBTiles run is whichever run names `{z}` in its
            // output path. Driving this off a separate flag would let the
            // two disagree and open multiple independent SQLite pools
            // against the same physical file.
            SinkKind::Mbtiles if config.output_path.contains("{z}") => Arc::new(ShardedMbtilesSink::new(
                config.output_path.clone(),
                provider.extension.clone(),
                config.scheme.clone(),
            )),
            SinkKind::Mbtiles => Arc::new(
                MbtilesSink::open(
                    std::path::Path::new(&config.output_path),
                    &provider.extension,
                    &config.scheme,
                )
                .await?,
            ),
        };

        let client = Arc::new(
            worker::build_client(&format!("tile-harvester/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|e| HarvestError::Fatal(format!("failed to build HTTP client: {e}")))?,
        );

        let shared = Arc::new(SharedState {
            stop: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
            total_tasks: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
            source_done: Arc::new(AtomicBool::new(false)),
            run_state: std::sync::Mutex::new(RunState::Idle),
            run_started: Arc::new(AtomicBool::new(false)),
        });

        let (reporter, progress_rx) = ProgressReporter::new(ledger.counts.clone(), shared.total_tasks.clone());
        let reporter = Arc::new(reporter);

        spawn_signal_trap(shared.stop.clone(), shared.run_started.clone());

        Ok(Controller {
            config,
            provider,
            ledger,
            sink,
            client,
            shared,
            reporter,
            progress_rx,
        })
    }

    pub fn state(&self) -> RunState {
        *self.shared.run_state.lock().unwrap()
    }

    fn set_state(&self, state: RunState) {
        *self.shared.run_state.lock().unwrap() = state;
    }

    /// `POST /runs/{id}/pause`: sets the pause flag, waits briefly for
    /// workers and the task source to observe it, then flushes the ledger
    /// so a crash while paused loses nothing already completed.
    pub async fn pause(&self) {
        self.shared.paused.store(true, Ordering::Relaxed);
        self.set_state(RunState::Paused);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        if let Err(e) = self.ledger.flush().await {
            tracing::warn!(error = %e, "ledger flush on pause failed");
        }
    }

    /// `POST /runs/{id}/resume`.
    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::Relaxed);
        self.set_state(RunState::Running);
    }

    /// `POST /runs/{id}/cancel`: a cooperative stop, honored at the next
    /// task boundary rather than aborting in-flight work. Clears the pause
    /// flag too, so a worker parked on a pause can observe the stop
    /// instead of waiting for a `resume` that will never come.
    pub fn cancel(&self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        self.shared.paused.store(false, Ordering::Relaxed);
    }

    /// `GET /runs/{id}` — current totals, safe to poll cheaply.
    pub fn statistics(&self) -> ProgressSnapshot {
        *self.progress_rx.borrow()
    }

    /// `GET /runs/{id}/events` (SSE): a live feed of progress snapshots.
    pub fn subscribe_progress(&self) -> watch::Receiver<ProgressSnapshot> {
        self.progress_rx.clone()
    }

    /// Enumerates the configured bbox/zoom range against a freshly built
    /// worker pool, and blocks until every tile has been processed,
    /// cancelled, or the process received a shutdown signal. Returns the
    /// final progress snapshot.
    pub async fn run(&self) -> Result<ProgressSnapshot> {
        self.shared.run_started.store(true, Ordering::Relaxed);
        self.set_state(RunState::Running);

        self.ledger.load_for_range(self.config.min_zoom, self.config.max_zoom).await?;

        let (periodic_stop_tx, periodic_stop_rx) = watch::channel(false);
        let periodic_reporter = self.reporter.clone();
        let periodic_handle = tokio::spawn(async move {
            periodic_reporter
                .run_periodic(std::time::Duration::from_secs(2), periodic_stop_rx)
                .await;
        });

        let result = self.run_to_completion().await;

        let _ = periodic_stop_tx.send(true);
        periodic_handle.await.ok();

        // Flush and finalize regardless of how the run ended: a clean
        // completion, a cancel, or a fatal error mid-flight should all
        // leave the ledger and sink in a valid, resumable state. A
        // cancelled run uses `Sink::cancel` rather than `finalize` since it
        // may be finalizing a sink with no completed batch at all.
        if let Err(e) = self.ledger.flush().await {
            tracing::error!(error = %e, "ledger flush on run end failed");
        }
        let was_cancelled = self.shared.stop.load(Ordering::Relaxed);
        let sink_close = if was_cancelled {
            self.sink.cancel().await
        } else {
            self.sink.finalize().await
        };
        if let Err(e) = sink_close {
            tracing::error!(error = %e, "sink close on run end failed");
        }

        result?;

        let final_state = if was_cancelled {
            RunState::Cancelled
        } else {
            RunState::Completed
        };
        self.set_state(final_state);

        self.reporter.publish_final();
        Ok(*self.progress_rx.borrow())
    }

    async fn run_to_completion(&self) -> Result<()> {
        let (tx, rx) = mpsc::channel(TASK_CHANNEL_CAPACITY);
        let source_stats = Arc::new(TaskSourceStats::default());

        let source = TaskSource::new(
            self.config.west,
            self.config.south,
            self.config.east,
            self.config.north,
            self.config.min_zoom,
            self.config.max_zoom,
            self.config.is_tms,
            self.ledger.clone(),
            source_stats.clone(),
        );

        let cancel_for_source = self.shared.stop.clone();
        let paused_for_source = self.shared.paused.clone();
        let tx_for_source = tx.clone();
        let total_tasks_for_source = self.shared.total_tasks.clone();
        let in_flight_for_source = self.shared.in_flight.clone();
        let source_done_for_source = self.shared.source_done.clone();
        let source_handle = tokio::spawn(async move {
            source
                .run(
                    tx_for_source,
                    cancel_for_source,
                    paused_for_source,
                    total_tasks_for_source,
                    in_flight_for_source,
                    source_done_for_source,
                )
                .await;
        });

        let worker_ctx = Arc::new(WorkerContext {
            client: self.client.clone(),
            provider: self.provider.clone(),
            sink: self.sink.clone(),
            ledger: self.ledger.clone(),
            retries: self.config.retries,
            stop: self.shared.stop.clone(),
            paused: self.shared.paused.clone(),
            in_flight: self.shared.in_flight.clone(),
            source_done: self.shared.source_done.clone(),
        });

        let worker_count = worker::worker_count(self.config.threads);
        tracing::info!(workers = worker_count, provider = %self.config.provider_name, "starting harvest run");

        let mut worker_handles = Vec::with_capacity(worker_count);

        // mpsc::Receiver has no resubscribe; share it behind a mutex so
        // every worker can pull from the single queue.
        let shared_rx = Arc::new(tokio::sync::Mutex::new(rx));
        for _ in 0..worker_count {
            let ctx = worker_ctx.clone();
            let requeue = tx.clone();
            let rx = shared_rx.clone();
            let reporter = self.reporter.clone();
            worker_handles.push(tokio::spawn(async move {
                worker::run(rx, requeue, ctx, move || reporter.publish()).await;
            }));
        }
        drop(tx);

        source_handle.await.map_err(|e| HarvestError::Fatal(e.to_string()))?;

        for handle in worker_handles {
            handle.await.map_err(|e| HarvestError::Fatal(e.to_string()))?;
        }

        Ok(())
    }
}

/// Traps SIGINT/SIGTERM and turns the first one into a cooperative stop.
/// Per spec.md §6, the process exits 0 on a shutdown signal if a run had
/// actually started, non-zero otherwise: if `run_started` isn't set yet
/// (the signal arrived before `Controller::run` was ever entered — still
/// constructing collaborators, or sitting idle between `new` and `run`),
/// there is no in-flight harvest for the cooperative stop flag to wind
/// down, so this exits the process directly instead of falling through to
/// `main`'s normal `Ok(())` return. If a run had started, the cooperative
/// path (the stop flag draining the task source and worker pool, then
/// `Controller::run` flushing the ledger and finalizing the sink) already
/// gets the process to exit 0 via `main`'s ordinary return.
fn spawn_signal_trap(stop: Arc<AtomicBool>, run_started: Arc<AtomicBool>) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to install Ctrl+C handler");
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to install SIGTERM handler");
                }
            }
        };

        #[cfg(unix)]
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
        }

        #[cfg(not(unix))]
        ctrl_c.await;

        tracing::info!("shutdown signal received, cancelling run");
        stop.store(true, Ordering::Relaxed);

        if !run_started.load(Ordering::Relaxed) {
            tracing::error!("shutdown signal received before any run started, exiting non-zero");
            std::process::exit(1);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // A minimal valid PNG signature; content-type sanity checking only
    // looks at the response header, not the body.
    fn png_bytes() -> Vec<u8> {
        b"\x89PNG\r\n\x1a\n".to_vec()
    }

    fn world_z3_config(output: &std::path::Path, server_uri: &str, threads: usize) -> RunConfig {
        RunConfig::new(
            "custom",
            format!("{server_uri}/{{z}}/{{x}}/{{y}}.png"),
            vec![],
            -180.0,
            -85.0,
            180.0,
            85.0,
            3,
            3,
            threads,
            SinkKind::Directory,
            output.to_str().unwrap(),
        )
        .unwrap()
    }

    fn expected_world_z3_tiles() -> u64 {
        crate::tile_math::tiles_in_bbox(-180.0, -85.0, 180.0, 85.0, 3, false).len()
    }

    #[tokio::test]
    async fn clean_run_downloads_every_enumerated_tile() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/\d+/\d+/\d+\.png$"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png")
                    .set_body_bytes(png_bytes()),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let config = world_z3_config(&dir.path().join("tiles"), &server.uri(), 8);
        let controller = Controller::new(config).await.unwrap();
        let summary = controller.run().await.unwrap();

        let expected = expected_world_z3_tiles();
        assert_eq!(summary.downloaded, expected);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.processed(), summary.total_tasks);
        assert!(summary.completed);
        assert_eq!(controller.state(), RunState::Completed);
    }

    #[tokio::test]
    async fn permanent_errors_mark_failed_with_exactly_one_request_each() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/\d+/\d+/\d+\.png$"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let config = world_z3_config(&dir.path().join("tiles"), &server.uri(), 8);
        let controller = Controller::new(config).await.unwrap();
        let summary = controller.run().await.unwrap();

        let expected = expected_world_z3_tiles();
        assert_eq!(summary.failed, expected);
        assert_eq!(summary.downloaded, 0);
        // 403/404 is a permanent failure: the worker must not retry it.
        assert_eq!(
            server.received_requests().await.unwrap().len() as u64,
            expected
        );
    }

    #[tokio::test]
    async fn cancel_then_resume_with_identical_config_finishes_every_tile() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/\d+/\d+/\d+\.png$"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png")
                    .set_body_bytes(png_bytes())
                    .set_delay(std::time::Duration::from_millis(50)),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("tiles");
        let expected = expected_world_z3_tiles();

        let controller_a = Arc::new(Controller::new(world_z3_config(&output, &server.uri(), 4)).await.unwrap());
        let runner = {
            let c = controller_a.clone();
            tokio::spawn(async move { c.run().await })
        };
        // Long enough for enumeration to start and a handful of in-flight
        // GETs to be dispatched, short enough that the 50ms server delay
        // guarantees most of the bbox is still unfetched.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        controller_a.cancel();
        let first_summary = runner.await.unwrap().unwrap();
        assert!(first_summary.downloaded < expected);
        assert_eq!(controller_a.state(), RunState::Cancelled);

        // A fresh controller over the same output/ledger path, with an
        // identical bbox/zoom/provider configuration, must pick up exactly
        // where the first run left off.
        let controller_b = Controller::new(world_z3_config(&output, &server.uri(), 4)).await.unwrap();
        let second_summary = controller_b.run().await.unwrap();

        assert_eq!(second_summary.downloaded, expected);
        assert_eq!(second_summary.failed, 0);
    }

    #[tokio::test]
    async fn pause_then_resume_completes_without_double_counting() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/\d+/\d+/\d+\.png$"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png")
                    .set_body_bytes(png_bytes())
                    .set_delay(std::time::Duration::from_millis(5)),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let expected = expected_world_z3_tiles();
        let controller = Arc::new(
            Controller::new(world_z3_config(&dir.path().join("tiles"), &server.uri(), 4))
                .await
                .unwrap(),
        );

        let runner = {
            let c = controller.clone();
            tokio::spawn(async move { c.run().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(15)).await;
        controller.pause().await;
        tokio::time::sleep(std::time::Duration::from_millis(15)).await;
        controller.resume();

        let summary = runner.await.unwrap().unwrap();
        assert_eq!(summary.downloaded, expected);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.processed(), expected);
    }
}
