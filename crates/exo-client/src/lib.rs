//! Client facade for the exo realtime connection layer.
//!
//! Provides:
//! - `ClientConfig` - TOML configuration with environment overrides
//! - `Client` - discovery, connection manager, display state and dispatch
//!   behind one handle

pub mod client;
pub mod config;
pub mod error;

pub use client::{Client, ConnectRequest, Connecting};
pub use config::ClientConfig;
pub use error::{ClientError, ConfigError};

// Re-exported so applications need only this crate.
pub use exo_core::{
    Address, ConnectionState, Envelope,
    envelope::{CHAT_MESSAGE, DOT_STATE, MESSAGE, VOICE_MESSAGE},
};
pub use exo_discovery::Candidate;
pub use exo_session::DisplayState;
