//! Breath event detection and respiratory rate estimation
//!
//! Consumes conditioned samples and emits inhale/exhale events using
//! threshold crossing with direction hysteresis and a refractory period.
//! Inhale/exhale pairs are consolidated into breath cycles strictly by
//! arrival index; the rolling BPM estimate is recomputed on a caller-driven
//! cadence from cycles in a trailing window.

use crate::ring::Ring;
use crate::sample::{MotionSample, PlotPoint};
use crate::signal::SignalConditioner;

/// Last detected signal direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    None,
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreathKind {
    Inhale,
    Exhale,
}

/// A detected breath event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreathEvent {
    pub kind: BreathKind,
    pub t_ms: u64,
}

/// Detector tuning parameters.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Refractory period between events (prevents double-counting noise)
    pub min_event_interval_ms: u64,
    /// Capacity of the inhale/exhale/cycle timestamp rings
    pub event_ring_capacity: usize,
    /// Capacity of the waveform plot ring
    pub plot_ring_capacity: usize,
    /// Minimum spacing between plot points
    pub plot_interval_ms: u64,
    /// Trailing window for BPM computation
    pub bpm_window_ms: u64,
    /// Per-tick decay factor applied when too few cycles are in-window
    pub bpm_decay: f64,
    /// EMA coefficient blending the instantaneous BPM into the estimate
    pub bpm_alpha: f64,
    /// Decayed estimates below this snap to zero
    pub bpm_floor: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_event_interval_ms: 300,
            event_ring_capacity: 200,
            plot_ring_capacity: 400,
            plot_interval_ms: 120,
            bpm_window_ms: 60_000,
            bpm_decay: 0.85,
            bpm_alpha: 0.25,
            bpm_floor: 0.1,
        }
    }
}

/// Streaming breath detector. Owned exclusively by one tracking run;
/// never mutated by relay-received data.
#[derive(Debug, Clone)]
pub struct BreathDetector {
    config: DetectorConfig,
    conditioner: SignalConditioner,
    direction: Direction,
    last_event_ms: Option<u64>,
    breath_in: u32,
    breath_out: u32,
    inhale_times: Ring<u64>,
    exhale_times: Ring<u64>,
    cycle_times: Ring<u64>,
    paired_index: u64,
    bpm: f64,
    plot: Ring<PlotPoint>,
    last_plot_ms: Option<u64>,
}

impl BreathDetector {
    pub fn new(config: DetectorConfig, conditioner: SignalConditioner) -> Self {
        let event_cap = config.event_ring_capacity;
        let plot_cap = config.plot_ring_capacity;
        Self {
            config,
            conditioner,
            direction: Direction::None,
            last_event_ms: None,
            breath_in: 0,
            breath_out: 0,
            inhale_times: Ring::new(event_cap),
            exhale_times: Ring::new(event_cap),
            cycle_times: Ring::new(plot_cap.min(event_cap)),
            paired_index: 0,
            bpm: 0.0,
            plot: Ring::new(plot_cap),
            last_plot_ms: None,
        }
    }

    /// Process one raw motion sample. Returns the detected event, if any.
    pub fn process_sample(&mut self, sample: &MotionSample) -> Option<BreathEvent> {
        let raw = sample.primary_axis()?;
        let conditioned = self.conditioner.process(raw);
        let t = sample.t_ms;

        // Plot points are throttled independently of detection so the
        // waveform stays smooth without growing unbounded.
        let plot_due = self
            .last_plot_ms
            .map_or(true, |last| t.saturating_sub(last) >= self.config.plot_interval_ms);
        if plot_due {
            self.plot.push(PlotPoint {
                x: t,
                y: conditioned.value,
            });
            self.last_plot_ms = Some(t);
        }

        let refractory_ok = self
            .last_event_ms
            .map_or(true, |last| t.saturating_sub(last) > self.config.min_event_interval_ms);

        let event = if conditioned.value > conditioned.threshold
            && self.direction != Direction::Up
            && refractory_ok
        {
            self.direction = Direction::Up;
            self.last_event_ms = Some(t);
            self.breath_in += 1;
            self.inhale_times.push(t);
            Some(BreathEvent {
                kind: BreathKind::Inhale,
                t_ms: t,
            })
        } else if conditioned.value < -conditioned.threshold
            && self.direction != Direction::Down
            && refractory_ok
        {
            self.direction = Direction::Down;
            self.last_event_ms = Some(t);
            self.breath_out += 1;
            self.exhale_times.push(t);
            Some(BreathEvent {
                kind: BreathKind::Exhale,
                t_ms: t,
            })
        } else {
            None
        };

        if event.is_some() {
            self.consolidate_cycles();
        }
        event
    }

    /// Pair inhale/exhale timestamps strictly by arrival index. One inhale
    /// plus one exhale (in arrival order, not necessarily alternating) is
    /// one cycle; its time is the later of the pair. Index pairing can
    /// mis-pair under irregular breathing, but the BPM calibration depends
    /// on this exact policy.
    fn consolidate_cycles(&mut self) {
        loop {
            let i = self.paired_index;
            if i >= self.inhale_times.total_pushed() || i >= self.exhale_times.total_pushed() {
                break;
            }
            match (self.inhale_times.get_abs(i), self.exhale_times.get_abs(i)) {
                (Some(&inhale), Some(&exhale)) => {
                    self.cycle_times.push(inhale.max(exhale));
                    self.paired_index = i + 1;
                }
                // One side was evicted by the ring bound; the pair is lost.
                _ => {
                    self.paired_index = i + 1;
                }
            }
        }
    }

    /// Recompute the rolling BPM estimate. Runs on an independent periodic
    /// cadence (~1s), not per-sample.
    ///
    /// Fewer than two in-window cycles decays the estimate toward zero
    /// instead of reporting zero abruptly, avoiding visual jumps when
    /// breathing pauses briefly. Identical or non-monotonic first/last
    /// timestamps also take the decay path (guards divide-by-zero).
    pub fn recompute_bpm(&mut self, now_ms: u64) {
        let window_start = now_ms.saturating_sub(self.config.bpm_window_ms);
        let mut first = None;
        let mut last = None;
        let mut count = 0usize;
        for &t in self.cycle_times.iter() {
            if t >= window_start && t <= now_ms {
                if first.is_none() {
                    first = Some(t);
                }
                last = Some(t);
                count += 1;
            }
        }

        match (first, last) {
            (Some(first), Some(last)) if count >= 2 && last > first => {
                let mean_interval = (last - first) as f64 / (count - 1) as f64;
                let instant = 60_000.0 / mean_interval;
                self.bpm = self.config.bpm_alpha * instant + (1.0 - self.config.bpm_alpha) * self.bpm;
            }
            _ => {
                self.bpm *= self.config.bpm_decay;
                if self.bpm < self.config.bpm_floor {
                    self.bpm = 0.0;
                }
            }
        }
    }

    pub fn breath_in(&self) -> u32 {
        self.breath_in
    }

    pub fn breath_out(&self) -> u32 {
        self.breath_out
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    pub fn paired_index(&self) -> u64 {
        self.paired_index
    }

    pub fn cycle_count(&self) -> usize {
        self.cycle_times.len()
    }

    pub fn last_plot_point(&self) -> Option<PlotPoint> {
        self.plot.back().copied()
    }

    pub fn plot_points(&self) -> Vec<PlotPoint> {
        self.plot.iter().copied().collect()
    }

    pub fn sensitivity(&self) -> u8 {
        self.conditioner.sensitivity()
    }

    pub fn set_sensitivity(&mut self, sensitivity: u8) {
        self.conditioner.set_sensitivity(sensitivity);
    }

    /// Full reset: counters, rings, BPM, and filter state all cleared.
    pub fn reset(&mut self) {
        self.conditioner.reset();
        self.direction = Direction::None;
        self.last_event_ms = None;
        self.breath_in = 0;
        self.breath_out = 0;
        self.inhale_times.clear();
        self.exhale_times.clear();
        self.cycle_times.clear();
        self.paired_index = 0;
        self.bpm = 0.0;
        self.plot.clear();
        self.last_plot_ms = None;
    }
}
