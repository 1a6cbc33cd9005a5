//! Shift pipeline task
//!
//! The only owner of the `ShiftEngine`. Samples arrive from ingest, control
//! requests arrive from the API, and stored curves arrive from background
//! loads. Everything is handled on this one task, so the engine needs no lock.

use crate::state::AppState;
use crate::store::CurveStore;
use gst_core::{EngineCurve, EngineEvent, Sample, ShiftEngine};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const LOADED_CHANNEL_CAPACITY: usize = 4;

/// Stored curve tagged with the load generation that requested it
type LoadedCurve = (u64, i32, EngineCurve);

/// Requests the API sends to the pipeline
#[derive(Debug)]
pub enum EngineCommand {
    /// Replies with the value actually applied after clamping
    SetToneOffset {
        value: f64,
        reply: oneshot::Sender<f64>,
    },
    Reset {
        reply: oneshot::Sender<()>,
    },
}

pub struct Pipeline {
    engine: ShiftEngine,
    state: AppState,
    store: CurveStore,
    /// Bumped on every car change and reset; older loads are stale
    generation: u64,
}

impl Pipeline {
    pub fn new(engine: ShiftEngine, state: AppState, store: CurveStore) -> Self {
        Self {
            engine,
            state,
            store,
            generation: 0,
        }
    }

    /// Run until cancelled or ingest hangs up, then hand back the engine
    pub async fn run(
        mut self,
        mut samples: mpsc::Receiver<Sample>,
        mut commands: mpsc::Receiver<EngineCommand>,
        cancel: CancellationToken,
    ) -> ShiftEngine {
        let (loaded_tx, mut loaded_rx) = mpsc::channel(LOADED_CHANNEL_CAPACITY);
        info!("Pipeline started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(command) = commands.recv() => self.handle_command(command).await,
                Some((generation, car_ordinal, curve)) = loaded_rx.recv() => {
                    self.install_loaded(generation, car_ordinal, curve, &loaded_tx).await;
                }
                sample = samples.recv() => match sample {
                    Some(sample) => self.handle_sample(&sample, &loaded_tx).await,
                    None => {
                        info!("Sample channel closed");
                        break;
                    }
                },
            }
        }

        info!(
            "Pipeline stopped after {} samples",
            self.engine.snapshot().samples_processed
        );
        self.engine
    }

    async fn handle_sample(
        &mut self,
        sample: &Sample,
        loaded_tx: &mpsc::Sender<LoadedCurve>,
    ) {
        let out = self.engine.process(sample);
        if let Some(cue) = out.cue {
            debug!("Cue for gear {} at {:.0} RPM", cue.gear, cue.rpm);
            // No subscribers is fine
            let _ = self.state.cue_tx.send(cue);
        }
        self.handle_events(out.events, loaded_tx).await;
        self.publish().await;
    }

    async fn handle_events(
        &mut self,
        events: Vec<EngineEvent>,
        loaded_tx: &mpsc::Sender<LoadedCurve>,
    ) {
        for event in events {
            match event {
                EngineEvent::CarChanged { car_ordinal } => {
                    self.generation += 1;
                    *self.state.curve.write().await = None;
                    self.spawn_load(car_ordinal, loaded_tx.clone());
                }
                EngineEvent::CurveUpdated { origin, .. } => {
                    let curve = self.engine.curve().cloned();
                    if origin.is_some() {
                        if let (Some(car_ordinal), Some(curve)) =
                            (self.engine.car_ordinal(), curve.clone())
                        {
                            self.spawn_save(car_ordinal, curve);
                        }
                    }
                    *self.state.curve.write().await = curve;
                }
                other => debug!("Engine event: {:?}", other),
            }
        }
    }

    /// Look up a stored curve for the new car without holding up samples
    fn spawn_load(&self, car_ordinal: i32, loaded_tx: mpsc::Sender<LoadedCurve>) {
        let store = self.store.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            match store.load_async(car_ordinal).await {
                Ok(Some(curve)) => {
                    let _ = loaded_tx.send((generation, car_ordinal, curve)).await;
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to load curve for car {}: {:#}", car_ordinal, e),
            }
        });
    }

    fn spawn_save(&self, car_ordinal: i32, curve: EngineCurve) {
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.save_async(car_ordinal, curve).await {
                warn!("Failed to save curve for car {}: {:#}", car_ordinal, e);
            }
        });
    }

    async fn install_loaded(
        &mut self,
        generation: u64,
        car_ordinal: i32,
        curve: EngineCurve,
        loaded_tx: &mpsc::Sender<LoadedCurve>,
    ) {
        if generation != self.generation || self.engine.car_ordinal() != Some(car_ordinal) {
            debug!("Car changed or reset before curve for {} loaded", car_ordinal);
            return;
        }
        if self.engine.curve().is_some() {
            debug!("Curve for {} already learned, stored one skipped", car_ordinal);
            return;
        }
        let events = self.engine.install_curve(curve);
        self.handle_events(events, loaded_tx).await;
        self.publish().await;
    }

    async fn handle_command(&mut self, command: EngineCommand) {
        // Replies go out after publishing, so callers see the new snapshot
        match command {
            EngineCommand::SetToneOffset { value, reply } => {
                let applied = self.engine.set_tone_offset(value);
                self.publish().await;
                let _ = reply.send(applied);
            }
            EngineCommand::Reset { reply } => {
                self.generation += 1;
                self.engine.reset();
                *self.state.curve.write().await = None;
                self.publish().await;
                info!("Engine reset");
                let _ = reply.send(());
            }
        }
    }

    async fn publish(&self) {
        *self.state.snapshot.write().await = self.engine.snapshot();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gst_adapters::demo::CAR_ORDINAL;
    use gst_adapters::DemoAdapter;
    use gst_core::{SampleSource, ShiftConfig};

    fn spawn_pipeline(
        dir: &std::path::Path,
    ) -> (
        AppState,
        mpsc::Sender<Sample>,
        CancellationToken,
        tokio::task::JoinHandle<ShiftEngine>,
    ) {
        let config = ShiftConfig::default();
        let (state, commands_rx) = AppState::new(&config);
        let (tx, rx) = mpsc::channel(256);
        let cancel = CancellationToken::new();
        let pipeline = Pipeline::new(ShiftEngine::new(config), state.clone(), CurveStore::new(dir));
        let task = tokio::spawn(pipeline.run(rx, commands_rx, cancel.clone()));
        (state, tx, cancel, task)
    }

    #[tokio::test]
    async fn test_tone_offset_command_is_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _tx, cancel, task) = spawn_pipeline(dir.path());

        let (reply, rx) = oneshot::channel();
        state
            .commands
            .send(EngineCommand::SetToneOffset { value: 100.0, reply })
            .await
            .unwrap();
        assert_eq!(rx.await.unwrap(), 25.0);
        assert_eq!(state.snapshot.read().await.tone_offset.value, 25.0);

        cancel.cancel();
        let engine = task.await.unwrap();
        assert_eq!(engine.tone_offset(), 25.0);
    }

    #[tokio::test]
    async fn test_stored_curve_is_installed_for_new_car() {
        let dir = tempfile::tempdir().unwrap();
        let store = CurveStore::new(dir.path());
        let curve = EngineCurve::from_points(
            vec![3000.0, 5000.0, 7200.0],
            vec![0.9, 1.0, 0.8],
            vec![0.6, 1.0, 0.95],
            gst_core::PowerUnit::Relative,
        )
        .unwrap();
        store.save(CAR_ORDINAL, &curve).unwrap();

        let (state, tx, cancel, task) = spawn_pipeline(dir.path());
        let mut adapter = DemoAdapter::new();
        adapter.start().unwrap();
        tx.send(adapter.read_sample().unwrap().unwrap()).await.unwrap();

        let mut snapshot = state.snapshot.read().await.clone();
        for _ in 0..200 {
            if !snapshot.collecting {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            snapshot = state.snapshot.read().await.clone();
        }
        assert!(!snapshot.collecting, "stored curve should stop collection");
        assert_eq!(snapshot.car_ordinal, Some(CAR_ORDINAL));
        assert_eq!(snapshot.revlimit, Some(7200.0));

        let installed = state.curve.read().await.clone().expect("curve should be published");
        assert_eq!(installed.revlimit(), 7200.0);

        cancel.cancel();
        task.await.unwrap();
    }

    fn stored_curve(revlimit: f64) -> EngineCurve {
        EngineCurve::from_points(
            vec![3000.0, 5000.0, revlimit],
            vec![0.9, 1.0, 0.8],
            vec![0.6, 1.0, 0.95],
            gst_core::PowerUnit::Relative,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_late_curve_load_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let config = ShiftConfig::default();
        let (state, _commands) = AppState::new(&config);
        let mut pipeline =
            Pipeline::new(ShiftEngine::new(config), state.clone(), CurveStore::new(dir.path()));
        let (loaded_tx, _loaded_rx) = mpsc::channel(LOADED_CHANNEL_CAPACITY);

        let mut adapter = DemoAdapter::new();
        adapter.start().unwrap();
        let sample = adapter.read_sample().unwrap().unwrap();
        pipeline.handle_sample(&sample, &loaded_tx).await;
        let first = pipeline.generation;

        // Same car comes back after a reset; the first load is now stale
        let (reply, _reply_rx) = oneshot::channel();
        pipeline.handle_command(EngineCommand::Reset { reply }).await;
        pipeline.handle_sample(&sample, &loaded_tx).await;
        assert_eq!(pipeline.engine.car_ordinal(), Some(CAR_ORDINAL));

        pipeline
            .install_loaded(first, CAR_ORDINAL, stored_curve(7200.0), &loaded_tx)
            .await;
        assert!(pipeline.engine.curve().is_none());
        assert!(state.curve.read().await.is_none());

        let current = pipeline.generation;
        pipeline
            .install_loaded(current, CAR_ORDINAL, stored_curve(7200.0), &loaded_tx)
            .await;
        assert_eq!(state.snapshot.read().await.revlimit, Some(7200.0));

        // A second load never replaces a curve already in place
        pipeline
            .install_loaded(current, CAR_ORDINAL, stored_curve(6800.0), &loaded_tx)
            .await;
        assert_eq!(pipeline.engine.curve().map(EngineCurve::revlimit), Some(7200.0));
        assert_eq!(state.snapshot.read().await.revlimit, Some(7200.0));
    }

    #[tokio::test]
    async fn test_pipeline_ends_when_ingest_hangs_up() {
        let dir = tempfile::tempdir().unwrap();
        let (_state, tx, _cancel, task) = spawn_pipeline(dir.path());
        drop(tx);
        let engine = task.await.unwrap();
        assert_eq!(engine.car_ordinal(), None);
    }
}
