//! Relay wire protocol
//!
//! Events travel as JSON text frames over a persistent WebSocket
//! connection. Both directions use internally tagged enums so a single
//! dispatch point can handle every message; anything that fails to parse
//! is dropped by the receiver, never propagated as a crash.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::sample::PlotPoint;

/// Length of a session join code.
pub const SESSION_CODE_LEN: usize = 6;

/// Client-side watchdog for join/create requests with no response.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(6);

/// Identifies one relay connection. Allocated by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A short human-relayable code binding one producer to its listeners.
///
/// Always exactly six ASCII digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionCode(String);

impl SessionCode {
    /// Validate and wrap a code string.
    pub fn new(code: impl Into<String>) -> Option<Self> {
        let code = code.into();
        if code.len() == SESSION_CODE_LEN && code.bytes().all(|b| b.is_ascii_digit()) {
            Some(Self(code))
        } else {
            None
        }
    }

    /// Generate a random 6-digit code. Collision checking against live
    /// codes is the caller's job.
    pub fn random(rng: &mut impl Rng) -> Self {
        Self(format!("{:06}", rng.gen_range(0..1_000_000u32)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One batched live-data entry inside `BreathData::samples`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreathSample {
    pub t: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub breath_in: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub breath_out: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub bpm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub point: Option<PlotPoint>,
}

/// Live counters and waveform edge broadcast by a producer.
///
/// Forwarded verbatim to every listener of `code`; the producer never
/// receives its own broadcast. Latest-value-wins for the counters, so a
/// dropped message is absorbed silently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreathData {
    pub code: SessionCode,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub t: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub breath_in: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub breath_out: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub bpm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub point: Option<PlotPoint>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub samples: Option<Vec<BreathSample>>,
}

/// Full current state of a producer's tracking run, used to back-fill a
/// newly joined listener without waiting for the next periodic broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub breath_in: u32,
    pub breath_out: u32,
    pub bpm: f64,
    pub points: Vec<PlotPoint>,
}

/// Events sent from a client to the relay server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Request a new producer session
    CreateSession,
    /// Request to listen to an existing session
    JoinSession { code: SessionCode },
    /// Release the current role without tearing down the session
    /// (listener leaving); a producer sending this ends the session.
    LeaveSession,
    /// Explicitly end the session (producer only)
    EndSession,
    /// Live counters/waveform from the producer
    BreathData(BreathData),
    /// Full-state sync, targeted at one listener or broadcast to all
    SessionSnapshot {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        to: Option<ConnId>,
        snapshot: Snapshot,
    },
}

/// Events sent from the relay server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// A producer session was created and bound to this connection
    SessionCreated { code: SessionCode },
    /// Join accepted; this connection is now a listener
    Joined { code: SessionCode },
    /// Join rejected (unknown code, no active producer, ...)
    JoinError { message: String },
    /// Audience change notices (producer only)
    ListenerJoined { listener: ConnId },
    ListenerLeft { listener: ConnId },
    /// Ask the producer to back-fill a newly joined listener
    RequestSnapshot { to: ConnId },
    /// Forwarded live data (listener only)
    BreathData(BreathData),
    /// Forwarded full-state sync (listener only)
    SessionSnapshot { snapshot: Snapshot },
    /// The producer ended the session or disconnected
    SessionEnded { code: SessionCode },
}
