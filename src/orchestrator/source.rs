//! Motion sample acquisition seam
//!
//! Platform sensor plumbing lives behind [`MotionSource`] so the
//! orchestrator can be driven by a real accelerometer feed or a scripted
//! stream in tests. Acquisition is fallible; a device may have no usable
//! sensor at all.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::sample::MotionSample;

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("motion sensing is not supported on this device")]
    Unsupported,
    #[error("motion sensor permission denied")]
    PermissionDenied,
    #[error("no motion data arrived within {0:?}")]
    NoData(Duration),
}

/// A stream of raw accelerometer samples.
///
/// `acquire` starts delivery and hands back the receiving end; dropping
/// the receiver or calling `release` stops it. Acquire/release may be
/// called repeatedly over the life of the source.
#[async_trait]
pub trait MotionSource: Send {
    async fn acquire(&mut self) -> Result<mpsc::Receiver<MotionSample>, SensorError>;
    async fn release(&mut self);
}
