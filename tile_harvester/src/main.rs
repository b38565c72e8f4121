use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tile_harvester::config::RunConfig;
use tile_harvester::controller::Controller;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = RunConfig::from_env()?;
    tracing::info!(
        provider = %config.provider_name,
        min_zoom = config.min_zoom,
        max_zoom = config.max_zoom,
        output = %config.output_path,
        "starting tile_harvester"
    );

    let controller = Controller::new(config).await?;

    let mut progress_rx = controller.subscribe_progress();
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::with_template(
            "{prefix} [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg} ETA {eta}",
        )?
        .progress_chars("##-"),
    );
    pb.set_draw_target(ProgressDrawTarget::stdout_with_hz(10));
    pb.set_prefix("tile_harvester");

    let progress_task = tokio::spawn(async move {
        loop {
            let snapshot = *progress_rx.borrow_and_update();
            pb.set_length(snapshot.total_tasks.max(1));
            pb.set_position(snapshot.processed());
            pb.set_message(format!(
                "ok={} failed={} skipped={}",
                snapshot.downloaded, snapshot.failed, snapshot.skipped
            ));
            if snapshot.completed {
                pb.finish_with_message(format!(
                    "done: ok={} failed={} skipped={}",
                    snapshot.downloaded, snapshot.failed, snapshot.skipped
                ));
                return;
            }
            if progress_rx.changed().await.is_err() {
                return;
            }
        }
    });

    let summary = controller.run().await?;
    progress_task.await.ok();

    tracing::info!(
        downloaded = summary.downloaded,
        failed = summary.failed,
        skipped = summary.skipped,
        total_bytes = summary.total_bytes,
        "run finished"
    );

    Ok(())
}
