//! camsource: stream a V4L2 camera into a frame analyzer until Ctrl-C

use std::path::PathBuf;
use std::sync::Arc;

use camsource::analyzer::FrameStatsAnalyzer;
use camsource::capture::v4l2::V4l2Backend;
use camsource::capture::CameraController;
use camsource::Config;
use color_eyre::{eyre::eyre, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing(filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    #[cfg(feature = "profiling")]
    {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime()))
            .with(tracing_tracy::TracyLayer::default())
            .init();
    }

    #[cfg(not(feature = "profiling"))]
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    init_tracing(&config.log.filter);

    info!("camsource launching...");

    let backend = if config.v4l2.devices.is_empty() {
        V4l2Backend::detect(config.v4l2.format)
    } else {
        V4l2Backend::new(config.v4l2.devices.clone(), config.v4l2.format)
    };

    let analyzer = FrameStatsAnalyzer::new(config.report_interval());
    let controller = CameraController::builder(Arc::new(backend), Box::new(analyzer))
        .configuration(config.camera_configuration()?)
        .buffer_count(config.pipeline.buffer_count)?
        .pipeline_options(config.pipeline_options())
        .build();
    let controller = Arc::new(controller);

    {
        let controller = controller.clone();
        tokio::task::spawn_blocking(move || controller.start().map(|_| ()))
            .await
            .map_err(|e| eyre!(e))??;
    }

    if let Some(info) = controller.stream_info() {
        info!(
            preview = %info.preview_size,
            facing = %info.facing,
            rotation = info.rotation.degrees(),
            "Streaming, press Ctrl-C to stop"
        );
    }

    tokio::signal::ctrl_c().await?;

    let stats = controller.stats();
    tokio::task::spawn_blocking(move || controller.release())
        .await
        .map_err(|e| eyre!(e))?;

    info!(
        received = stats.frames_received,
        analyzed = stats.frames_analyzed,
        dropped = stats.frames_dropped,
        failures = stats.analyzer_failures,
        "camsource shutting down"
    );
    Ok(())
}
