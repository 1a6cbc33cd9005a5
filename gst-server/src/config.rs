//! Server configuration
//!
//! A single JSON file holds the server settings and the full `ShiftConfig`.
//! The path comes from `GST_CONFIG`, falling back to the platform config
//! directory. A missing file means defaults.

use anyhow::{Context, Result};
use gst_core::ShiftConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "GST_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,

    /// Samples buffered between ingest and pipeline
    pub channel_capacity: usize,

    /// How long ingest waits on a full channel before dropping a sample
    pub send_timeout_ms: u64,

    /// Where curves are stored, one TSV file per car
    pub curve_dir: Option<PathBuf>,

    pub shift: ShiftConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 9100,
            channel_capacity: 256,
            send_timeout_ms: 50,
            curve_dir: None,
            shift: ShiftConfig::default(),
        }
    }
}

impl ServerConfig {
    /// `GST_CONFIG`, or `<config dir>/gst/config.json`
    pub fn default_path() -> Option<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|dir| dir.join("gst").join("config.json"))
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config
            .shift
            .validate()
            .with_context(|| format!("Invalid config {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)
            .with_context(|| format!("Failed to write config {}", path.display()))?;
        Ok(())
    }

    /// Configured curve directory, or `<data dir>/gst/curves`
    pub fn curve_dir(&self) -> PathBuf {
        self.curve_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("gst")
                .join("curves")
        })
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.bind_address, self.port))
    }
}

/// Store the learned tone offset as the new default in the config file
///
/// Everything else in the file is kept as it was.
pub fn write_back_tone_offset(path: &Path, value: f64) -> Result<()> {
    let mut config = ServerConfig::load(path)?;
    if config.shift.tone.default == value {
        return Ok(());
    }
    config.shift.tone.default = value;
    config.save(path)?;
    info!("Tone offset {:.1} written to {}", value, path.display());
    Ok(())
}
