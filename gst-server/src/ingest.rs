//! Sample ingest
//!
//! Reads samples from the active source at its own rate and hands them to the
//! pipeline over a bounded channel. When the pipeline falls behind, samples
//! are dropped rather than queued without limit.

use crate::state::{AppState, SourceStatus};
use anyhow::{Context, Result};
use gst_core::{Sample, SampleSource};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// ~60Hz, the rate GT7 sends at
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(16);

/// Read from `source` until cancelled or the pipeline goes away
pub async fn run(
    mut source: Box<dyn SampleSource>,
    tx: mpsc::Sender<Sample>,
    state: AppState,
    send_timeout: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let name = source.name().to_string();
    source
        .start()
        .with_context(|| format!("Failed to start source {}", name))?;
    info!("Source {} started", name);

    {
        let mut status = SourceStatus::new(&name);
        status.active = true;
        *state.source.write().await = Some(status);
    }

    let mut ticker = interval(SAMPLE_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let sample = match source.read_sample() {
            Ok(Some(sample)) => sample,
            Ok(None) => continue,
            Err(e) => {
                warn!("Error reading sample from {}: {}", name, e);
                continue;
            }
        };

        let dropped = match tx.send_timeout(sample, send_timeout).await {
            Ok(()) => false,
            Err(SendTimeoutError::Timeout(sample)) => {
                warn!("Pipeline busy, dropping sample {}", sample.index);
                true
            }
            Err(SendTimeoutError::Closed(_)) => {
                info!("Pipeline closed, stopping ingest");
                break;
            }
        };

        if let Some(status) = state.source.write().await.as_mut() {
            status.samples_read += 1;
            if dropped {
                status.samples_dropped += 1;
            }
        }
    }

    if let Err(e) = source.stop() {
        warn!("Error stopping source {}: {}", name, e);
    }
    if let Some(status) = state.source.write().await.as_mut() {
        status.active = false;
    }
    info!("Source {} stopped", name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gst_adapters::DemoAdapter;
    use gst_core::ShiftConfig;

    #[tokio::test]
    async fn test_ingest_forwards_samples_until_cancelled() {
        let (state, _commands) = AppState::new(&ShiftConfig::default());
        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run(
            Box::new(DemoAdapter::new()),
            tx,
            state.clone(),
            Duration::from_millis(50),
            cancel.clone(),
        ));

        let first = rx.recv().await.expect("ingest should send samples");
        let second = rx.recv().await.expect("ingest should keep sending");
        assert_eq!(first.index, 0);
        assert_eq!(second.index, 1);

        cancel.cancel();
        task.await.unwrap().unwrap();

        let status = state.source.read().await.clone().expect("status should be set");
        assert_eq!(status.name, "Demo");
        assert!(!status.active);
        assert!(status.samples_read >= 2);
    }

    #[tokio::test]
    async fn test_ingest_stops_when_pipeline_closes() {
        let (state, _commands) = AppState::new(&ShiftConfig::default());
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        run(
            Box::new(DemoAdapter::new()),
            tx,
            state,
            Duration::from_millis(10),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_ingest_drops_when_pipeline_is_full() {
        let (state, _commands) = AppState::new(&ShiftConfig::default());
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run(
            Box::new(DemoAdapter::new()),
            tx,
            state.clone(),
            Duration::from_millis(1),
            cancel.clone(),
        ));

        loop {
            let dropped = state
                .source
                .read()
                .await
                .as_ref()
                .map_or(0, |s| s.samples_dropped);
            if dropped > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
