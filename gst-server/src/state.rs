//! Application state shared between the pipeline and the API

use crate::pipeline::EngineCommand;
use chrono::{DateTime, Utc};
use gst_core::{EngineCurve, EngineSnapshot, ShiftConfig, ShiftCue, ShiftEngine};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_util::sync::CancellationToken;

const CUE_CHANNEL_CAPACITY: usize = 64;
const COMMAND_CHANNEL_CAPACITY: usize = 16;

/// What the ingest task reports about its source
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub name: String,
    pub active: bool,
    pub started_at: DateTime<Utc>,
    pub samples_read: u64,

    /// Samples thrown away because the pipeline fell behind
    pub samples_dropped: u64,
}

impl SourceStatus {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            active: false,
            started_at: Utc::now(),
            samples_read: 0,
            samples_dropped: 0,
        }
    }
}

/// Shared application state
///
/// The pipeline task owns the engine. Everything here is a published copy
/// of its state, or a way to reach it.
#[derive(Clone)]
pub struct AppState {
    /// Engine state as of the last processed sample
    pub snapshot: Arc<RwLock<EngineSnapshot>>,

    /// Curve in use for the current car
    pub curve: Arc<RwLock<Option<EngineCurve>>>,

    pub source: Arc<RwLock<Option<SourceStatus>>>,

    /// Broadcast channel for shift cues
    pub cue_tx: broadcast::Sender<ShiftCue>,

    /// Requests for the pipeline task
    pub commands: mpsc::Sender<EngineCommand>,

    /// Cancelled once on shutdown; every task watches it
    pub shutdown: CancellationToken,
}

impl AppState {
    /// State plus the receiving end of the command channel, for the pipeline
    pub fn new(config: &ShiftConfig) -> (Self, mpsc::Receiver<EngineCommand>) {
        let (cue_tx, _) = broadcast::channel(CUE_CHANNEL_CAPACITY);
        let (commands, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let snapshot = ShiftEngine::new(config.clone()).snapshot();

        let state = Self {
            snapshot: Arc::new(RwLock::new(snapshot)),
            curve: Arc::new(RwLock::new(None)),
            source: Arc::new(RwLock::new(None)),
            cue_tx,
            commands,
            shutdown: CancellationToken::new(),
        };
        (state, commands_rx)
    }

    /// Subscribe to shift cues
    pub fn subscribe(&self) -> broadcast::Receiver<ShiftCue> {
        self.cue_tx.subscribe()
    }
}
