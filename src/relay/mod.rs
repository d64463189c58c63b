//! Session relay: server-side registry and client-side state machine
//!
//! One device ("producer") broadcasts detector output to any number of
//! "listener" devices through a relay server keyed by a short join code.
//! Fan-out only; there is no listener-to-listener relay.

mod client;
mod registry;

pub use client::{ClientNotice, ClientState, RelayClient, StoredRole};
pub use registry::{Registry, RegistryStats};

use thiserror::Error;

/// Client-side relay failures.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The relay connection was never established or has dropped.
    /// Local-only tracking continues unaffected.
    #[error("not connected to the relay")]
    NotConnected,
}
