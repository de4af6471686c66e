//! Core types for the exo realtime connection layer.
//!
//! This crate provides the fundamental building blocks:
//! - `Envelope` - Wire-level message unit (JSON + base64 for binary)
//! - `Address`, `TransportKind` - Where a backend listens, and how
//! - `ConnectionState` - Session status and its permitted transitions
//! - `Transport` trait and the `Channel` handle every transport produces

pub mod address;
pub mod channel;
pub mod envelope;
pub mod state;
pub mod traits;

pub use address::{Address, TransportKind};
pub use channel::{Channel, ChannelEvent, ChannelIo};
pub use envelope::{Envelope, EnvelopeError};
pub use state::ConnectionState;
pub use traits::{Transport, TransportError};
