//! Motion sample and plot point types

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// A single raw accelerometer reading.
///
/// Produced by a platform motion source at irregular, device-determined
/// intervals (commonly 16-60 Hz). Consumed immediately, never stored.
/// Axes may be individually absent on devices that only expose a subset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionSample {
    /// Timestamp in milliseconds (device clock, unix epoch)
    pub t_ms: u64,
    pub ax: Option<f64>,
    pub ay: Option<f64>,
    pub az: Option<f64>,
}

impl MotionSample {
    pub fn new(t_ms: u64, ax: Option<f64>, ay: Option<f64>, az: Option<f64>) -> Self {
        Self { t_ms, ax, ay, az }
    }

    /// Single-axis reading for the breath pipeline.
    ///
    /// Prefers `ay` (chest-worn orientation assumption), falling back to
    /// `ax` then `az`. No cross-axis fusion is attempted; this is a known
    /// accuracy limitation when the phone is held in another orientation.
    pub fn primary_axis(&self) -> Option<f64> {
        self.ay.or(self.ax).or(self.az)
    }
}

/// One point of the rendered breath waveform.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlotPoint {
    /// Timestamp in milliseconds
    pub x: u64,
    /// Conditioned signal value
    pub y: f64,
}

/// Current wall-clock time in milliseconds since the unix epoch.
pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
