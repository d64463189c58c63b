//! Per-sample signal conditioning for the breath pipeline
//!
//! Turns one raw acceleration reading into a scalar "conditioned value"
//! plus an adaptive detection threshold:
//!
//! 1. slow low-pass isolates the DC/gravity component
//! 2. motion = raw - gravity
//! 3. light smoothing removes sample jitter
//! 4. user sensitivity gain (exponential around unity at the midpoint)
//! 5. EMA mean / mean-square track ambient noise level
//! 6. threshold = max(floor, std * hysteresis multiplier)
//!
//! The threshold self-adapts to the noise floor so small chest motion is
//! usable across devices without a fixed magic number.

/// Sensitivity range exposed to the user.
pub const MIN_SENSITIVITY: u8 = 1;
pub const MAX_SENSITIVITY: u8 = 5;

/// Filter coefficients and threshold parameters.
#[derive(Debug, Clone)]
pub struct ConditionerConfig {
    /// Gravity low-pass coefficient (weight on the previous estimate)
    pub gravity_alpha: f64,
    /// Motion smoothing coefficient (weight on the previous filtered value)
    pub smoothing_alpha: f64,
    /// EMA coefficient for adaptive statistics (weight on the new sample)
    pub stats_alpha: f64,
    /// Threshold floor
    pub min_threshold: f64,
    /// Multiplier applied to the running standard deviation
    pub hysteresis_multiplier: f64,
    /// Base of the exponential sensitivity gain
    pub gain_base: f64,
}

impl Default for ConditionerConfig {
    fn default() -> Self {
        Self {
            gravity_alpha: 0.98,
            smoothing_alpha: 0.5,
            stats_alpha: 0.05,
            min_threshold: 0.002,
            hysteresis_multiplier: 1.25,
            gain_base: 1.6,
        }
    }
}

/// Gain for a sensitivity setting: `base^(sensitivity - 3)`.
///
/// Midpoint sensitivity (3) is unity gain; each step scales by the base.
pub fn sensitivity_gain(base: f64, sensitivity: u8) -> f64 {
    let s = sensitivity.clamp(MIN_SENSITIVITY, MAX_SENSITIVITY);
    base.powi(s as i32 - 3)
}

/// Output of one conditioning step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Conditioned {
    /// Smoothed, gain-scaled motion value
    pub value: f64,
    /// Adaptive detection threshold for this sample
    pub threshold: f64,
}

/// Streaming signal conditioner. Pure state, no I/O.
#[derive(Debug, Clone)]
pub struct SignalConditioner {
    config: ConditionerConfig,
    sensitivity: u8,
    gravity: f64,
    filtered: f64,
    ema_mean: f64,
    ema_mean_sq: f64,
    primed: bool,
}

impl SignalConditioner {
    pub fn new(config: ConditionerConfig, sensitivity: u8) -> Self {
        Self {
            config,
            sensitivity: sensitivity.clamp(MIN_SENSITIVITY, MAX_SENSITIVITY),
            gravity: 0.0,
            filtered: 0.0,
            ema_mean: 0.0,
            ema_mean_sq: 0.0,
            primed: false,
        }
    }

    pub fn sensitivity(&self) -> u8 {
        self.sensitivity
    }

    pub fn set_sensitivity(&mut self, sensitivity: u8) {
        self.sensitivity = sensitivity.clamp(MIN_SENSITIVITY, MAX_SENSITIVITY);
    }

    /// Current sensitivity gain.
    pub fn gain(&self) -> f64 {
        sensitivity_gain(self.config.gain_base, self.sensitivity)
    }

    /// Condition one raw axis reading.
    pub fn process(&mut self, raw: f64) -> Conditioned {
        // Seed the gravity estimate with the first reading; starting from
        // zero would produce a multi-second DC transient at 0.98 alpha.
        if !self.primed {
            self.gravity = raw;
            self.primed = true;
        }

        let c = &self.config;
        self.gravity = c.gravity_alpha * self.gravity + (1.0 - c.gravity_alpha) * raw;
        let motion = raw - self.gravity;
        self.filtered = c.smoothing_alpha * self.filtered + (1.0 - c.smoothing_alpha) * motion;

        let scaled = self.filtered * self.gain();

        self.ema_mean = c.stats_alpha * scaled + (1.0 - c.stats_alpha) * self.ema_mean;
        self.ema_mean_sq =
            c.stats_alpha * scaled * scaled + (1.0 - c.stats_alpha) * self.ema_mean_sq;

        let variance = (self.ema_mean_sq - self.ema_mean * self.ema_mean).max(0.0);
        let threshold = (variance.sqrt() * c.hysteresis_multiplier).max(c.min_threshold);

        Conditioned {
            value: scaled,
            threshold,
        }
    }

    /// Clear all filter state. Sensitivity is preserved.
    pub fn reset(&mut self) {
        self.gravity = 0.0;
        self.filtered = 0.0;
        self.ema_mean = 0.0;
        self.ema_mean_sq = 0.0;
        self.primed = false;
    }
}
