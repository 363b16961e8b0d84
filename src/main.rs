use std::sync::Arc;

use tracing_subscriber::EnvFilter;

mod alerts;
mod analytics;
mod api;
mod camera;
mod config;
mod storage;
mod stream;
mod tracking;

use analytics::{ModelPool, OnnxDetectorFactory};
use api::AppState;
use camera::RtspSourceFactory;
use config::Config;
use stream::StreamManager;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("streamtrack=debug".parse()?))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    tracing::info!("loaded {} stream(s)", config.streams.len());

    camera::configure_ffmpeg_transport();

    let factory = OnnxDetectorFactory::new(config.models.dir.clone(), config.models.intra_threads);
    let manager = StreamManager::new(
        ModelPool::new(Arc::new(factory)),
        Arc::new(RtspSourceFactory),
    );

    let starter = manager.clone();
    let streams = config.streams;
    tokio::task::spawn_blocking(move || {
        for stream in streams {
            let stream_id = stream.id.clone();
            if let Err(e) = starter.start(stream) {
                tracing::error!(stream = %stream_id, error = %e, "failed to start stream");
            }
        }
    })
    .await?;

    let signal_manager = manager.clone();
    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
            return;
        }
        tracing::info!("shutdown signal received");
        signal_manager.shutdown();
    };

    api::start_server(AppState::new(manager.clone()), config.http.port, shutdown).await?;

    manager.shutdown();
    manager.join_all().await;
    tracing::info!("shutdown complete");

    Ok(())
}
