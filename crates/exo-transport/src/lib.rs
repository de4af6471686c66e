//! Transport implementations for the exo connection layer.
//!
//! Provides:
//! - Primary frame protocol (event/ack/heartbeat)
//! - `FramedTransport` - primary client channel
//! - `RawSocketTransport` - fallback client channel
//! - Backend endpoints for both (feature: server)
//! - Scripted transport for tests (feature: mock)

pub mod framed;
pub mod protocol;
pub mod websocket;

#[cfg(feature = "server")]
pub mod server;

#[cfg(feature = "mock")]
pub mod mock;

pub use framed::{FramedConfig, FramedTransport};
pub use protocol::{ClientFrame, ServerFrame};
pub use websocket::{RawSocketConfig, RawSocketTransport};
