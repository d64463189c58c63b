//! Ibuki - real-time breath tracking from device motion
//!
//! This crate provides everything needed to build a breath tracking
//! system:
//! - Signal: gravity removal, smoothing, adaptive thresholding
//! - Detector: inhale/exhale events, cycle pairing, rolling BPM
//! - Relay: live session fan-out keyed by 6-digit join codes
//! - Orchestrator: one task owning a device's tracking run
//! - Storage: finished-session persistence
//!
//! # Architecture
//!
//! A producer device runs the detector over its accelerometer stream and
//! broadcasts counters and waveform points through the relay. Any number
//! of listener devices join with the session code and mirror the
//! producer's display; they never run detection themselves.
//!
//! # Example - local tracking
//!
//! ```ignore
//! use ibuki::{Command, Orchestrator, OrchestratorConfig};
//!
//! let (orch, cmd) = Orchestrator::new(config, source, store, relay_tx, server_rx, ui_tx);
//! tokio::spawn(orch.run());
//! cmd.send(Command::Start)?;
//! ```
//!
//! # Example - relay server
//!
//! ```ignore
//! use ibuki::relay::Registry;
//!
//! let registry = Registry::new();
//! ibuki::web::serve(registry, "0.0.0.0:7890".parse()?).await?;
//! ```

// Raw samples and timebase
pub mod sample;

// Bounded history with stable absolute indices
pub mod ring;

// Signal conditioning
pub mod signal;

// Breath event detection and BPM
pub mod detector;

// Wire protocol
pub mod protocol;

// Session relay (server registry + client state machine)
pub mod relay;

// Session orchestration
pub mod orchestrator;

// Finished-session persistence
pub mod storage;

// HTTP/WebSocket bridge
pub mod web;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// Samples
pub use sample::{now_unix_ms, MotionSample, PlotPoint};

// Signal and detection
pub use detector::{BreathDetector, BreathEvent, BreathKind, DetectorConfig};
pub use signal::{sensitivity_gain, ConditionerConfig, SignalConditioner};

// Protocol
pub use protocol::{
    BreathData, ClientEvent, ConnId, ServerEvent, SessionCode, Snapshot, JOIN_TIMEOUT,
    SESSION_CODE_LEN,
};

// Relay
pub use relay::{ClientState, Registry, RegistryStats, RelayClient, RelayError};

// Orchestration
pub use orchestrator::{
    Command, DisplayState, MotionSource, Orchestrator, OrchestratorConfig, SensorError, UiEvent,
};

// Storage
pub use storage::{BreathSessionRecord, LocalStore, RecordSample, SessionStore};
