//! Session layer for the exo realtime connection.
//!
//! Provides:
//! - `ConnectionManager` - one logical session over primary and fallback
//!   transports, with reconnect and an outbound queue
//! - `ReconnectPolicy` - capped exponential backoff
//! - `UiStateProjector` - connection state to display state
//! - `EnvelopeRouter` - per-type inbound dispatch

pub mod backoff;
pub mod manager;
pub mod projector;
pub mod queue;
pub mod router;

pub use backoff::ReconnectPolicy;
pub use manager::{ConnectionManager, ManagerConfig, ManagerError};
pub use projector::{DisplayState, UiStateProjector, spawn_projector};
pub use queue::OutboundQueue;
pub use router::{EnvelopeRouter, HandlerId};
