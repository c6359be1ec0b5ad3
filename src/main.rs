use std::sync::Arc;

use tracing_subscriber::EnvFilter;

mod analytics;
mod annotate;
mod api;
mod buffer;
mod camera;
mod config;
mod geometry;
mod pipeline;
mod shutdown;
mod store;
mod tasks;
mod tracking;

use analytics::{DetectError, Detector, YoloDetector};
use api::AppState;
use camera::{FfmpegOpener, SourceOpener};
use config::Config;
use pipeline::{FeedOrchestrator, LatestFrames};
use shutdown::Shutdown;
use store::CounterStore;
use tasks::{TaskQueue, Worker};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("parkwatch=debug".parse()?))
        .init();

    let config = Config::load()?;
    let store = CounterStore::open(&config.feeds_path, &config.store)?;
    let document = store.snapshot()?;
    tracing::info!(
        path = %config.feeds_path.display(),
        feeds = document.feeds.len(),
        active = document.active_feeds().count(),
        "loaded feed document"
    );

    let worker_shutdown = Shutdown::new();
    let (tasks, worker) = if config.recognition.enabled {
        let (queue, receiver) = TaskQueue::bounded(config.recognition.queue_capacity);
        let recognition = config.recognition.clone();
        let handle = Worker::spawn(
            move || Worker::from_config(&recognition),
            receiver,
            worker_shutdown.clone(),
        )?;
        (Some(queue), Some(handle))
    } else {
        tracing::info!("plate recognition disabled");
        (None, None)
    };

    let opener: Arc<dyn SourceOpener> = Arc::new(FfmpegOpener {
        width: config.pipeline.capture_width,
        height: config.pipeline.capture_height,
    });
    let model_path = config.detector.model_path.clone();
    let detectors = move || -> Result<Box<dyn Detector>, DetectError> {
        Ok(Box::new(YoloDetector::vehicles(&model_path)?))
    };
    let frames = LatestFrames::new();

    // opening sources retries with blocking sleeps
    let orchestrator = {
        let store = store.clone();
        let config = config.clone();
        let sink = Arc::new(frames.clone());
        tokio::task::spawn_blocking(move || {
            FeedOrchestrator::start(&store, &config, opener, &detectors, tasks, sink)
        })
        .await??
    };
    let orchestrator = Arc::new(orchestrator);

    if orchestrator.active_feeds().is_empty() {
        tracing::warn!("no feeds running");
    }

    let state = AppState::new(store.clone(), Arc::clone(&orchestrator), frames);
    let port = config.http.port;
    let server = tokio::spawn(async move {
        if let Err(e) = api::start_server(state, port).await {
            tracing::error!(error = %e, "HTTP server failed");
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    server.abort();

    let stopping = Arc::clone(&orchestrator);
    tokio::task::spawn_blocking(move || stopping.stop()).await?;

    worker_shutdown.trigger();
    if let Some(handle) = worker {
        let joined = tokio::time::timeout(
            config.pipeline.join_timeout(),
            tokio::task::spawn_blocking(move || handle.join()),
        )
        .await;
        if joined.is_err() {
            tracing::warn!("plate worker did not stop in time, abandoning it");
        }
    }

    let document = store.snapshot()?;
    tracing::info!(
        global_car_count = document.global_car_count,
        degraded = store.is_degraded(),
        "shutdown complete"
    );

    Ok(())
}
