//! GT Shift Tone Server
//!
//! Runs the ingest and pipeline tasks and serves the status API

use anyhow::{Context, Result};
use gst_adapters::DemoAdapter;
use gst_core::ShiftEngine;
use gst_server::{
    api,
    config::{write_back_tone_offset, ServerConfig},
    ingest,
    pipeline::Pipeline,
    state::AppState,
    store::CurveStore,
};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting GT Shift Tone Server");

    let config_path = ServerConfig::default_path();
    let config = match &config_path {
        Some(path) => ServerConfig::load(path).unwrap_or_else(|e| {
            warn!("{:#}, using defaults", e);
            ServerConfig::default()
        }),
        None => {
            warn!("No config directory available, using defaults");
            ServerConfig::default()
        }
    };

    let store = CurveStore::new(config.curve_dir());
    info!("Curves stored in {}", store.dir().display());

    // Create application state
    let (state, commands_rx) = AppState::new(&config.shift);
    let (samples_tx, samples_rx) = mpsc::channel(config.channel_capacity);

    let pipeline = Pipeline::new(ShiftEngine::new(config.shift.clone()), state.clone(), store);
    let pipeline_task = tokio::spawn(pipeline.run(samples_rx, commands_rx, state.shutdown.clone()));

    let ingest_task = tokio::spawn(ingest::run(
        Box::new(DemoAdapter::new()),
        samples_tx,
        state.clone(),
        config.send_timeout(),
        state.shutdown.clone(),
    ));

    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            return;
        }
        info!("Shutting down");
        shutdown.cancel();
    });

    // Build the router
    let app = api::create_router(state.clone());

    // Start server
    let addr = config.socket_addr()?;
    info!("Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let shutdown = state.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    // The server can also stop on its own; make sure the tasks follow
    state.shutdown.cancel();

    match ingest_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Ingest failed: {:#}", e),
        Err(e) => error!("Ingest task panicked: {}", e),
    }
    let engine = pipeline_task.await.context("Pipeline task panicked")?;

    if let Some(path) = &config_path {
        if let Err(e) = write_back_tone_offset(path, engine.tone_offset()) {
            warn!("Failed to save tone offset: {:#}", e);
        }
    }

    Ok(())
}
