//! Sample source trait definition

use crate::model::Sample;
use anyhow::Result;

/// Trait for telemetry sample sources
///
/// A source owns whatever connection it needs (UDP socket, file, generator)
/// and hands out already-decoded `Sample`s. Packet decoding and decryption
/// stay inside the source.
pub trait SampleSource: Send {
    /// Human-readable source name (e.g., "Demo")
    fn name(&self) -> &str;

    /// Open connections or allocate resources
    fn start(&mut self) -> Result<()>;

    /// Release everything acquired in `start`
    fn stop(&mut self) -> Result<()>;

    /// Read the next sample
    ///
    /// Returns:
    /// - `Ok(Some(sample))` if a new sample is available
    /// - `Ok(None)` if no new data (non-blocking)
    /// - `Err(_)` if the source failed
    fn read_sample(&mut self) -> Result<Option<Sample>>;

    /// Whether `start` succeeded and `stop` has not been called
    fn is_active(&self) -> bool;
}
