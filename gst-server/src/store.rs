//! Per-car curve files
//!
//! Each learned curve is stored as `<car ordinal>.tsv` in one directory.

use anyhow::{Context, Result};
use gst_core::curve::tsv;
use gst_core::EngineCurve;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct CurveStore {
    dir: PathBuf,
}

impl CurveStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, car_ordinal: i32) -> PathBuf {
        self.dir.join(format!("{car_ordinal}.tsv"))
    }

    /// `Ok(None)` when no curve has been stored for this car
    pub fn load(&self, car_ordinal: i32) -> Result<Option<EngineCurve>> {
        let path = self.path_for(car_ordinal);
        if !path.exists() {
            debug!("No stored curve for car {}", car_ordinal);
            return Ok(None);
        }

        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read curve {}", path.display()))?;
        let curve = tsv::parse(&text)
            .with_context(|| format!("Failed to parse curve {}", path.display()))?;
        info!("Loaded curve for car {} from {}", car_ordinal, path.display());
        Ok(Some(curve))
    }

    pub fn save(&self, car_ordinal: i32, curve: &EngineCurve) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        // Write then rename so a reader never sees half a file
        let path = self.path_for(car_ordinal);
        let partial = path.with_extension("tsv.partial");
        std::fs::write(&partial, tsv::write(curve))
            .with_context(|| format!("Failed to write curve {}", partial.display()))?;
        std::fs::rename(&partial, &path)
            .with_context(|| format!("Failed to move curve into {}", path.display()))?;
        info!("Saved curve for car {} to {}", car_ordinal, path.display());
        Ok(())
    }

    pub async fn load_async(&self, car_ordinal: i32) -> Result<Option<EngineCurve>> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.load(car_ordinal)).await?
    }

    pub async fn save_async(&self, car_ordinal: i32, curve: EngineCurve) -> Result<()> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.save(car_ordinal, &curve)).await?
    }
}
