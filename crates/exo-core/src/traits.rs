//! Transport capability.

use std::time::Duration;

use thiserror::Error;

use crate::{Address, Channel, TransportKind};

/// Transport error.
///
/// None of these are fatal to a session: open failures and drops are retried,
/// `NotOpen` sends are buffered by the connection manager.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("{kind} transport failed to open: {reason}")]
    OpenFailed { kind: TransportKind, reason: String },
    #[error("{kind} transport dropped: {reason}")]
    Dropped { kind: TransportKind, reason: String },
    #[error("{kind} transport did not open within {after:?}")]
    Timeout { kind: TransportKind, after: Duration },
    #[error("Channel is not open")]
    NotOpen,
}

/// One concrete way of moving envelopes between client and backend.
///
/// `open` returns immediately; progress is observed through the returned
/// [`Channel`]'s lifecycle events. Implementations bound their own connect
/// phase with a timeout.
pub trait Transport: Send + Sync {
    /// Which transport this is.
    fn kind(&self) -> TransportKind;

    /// Start opening a channel to `address`.
    ///
    /// Must be called from within a Tokio runtime.
    fn open(&self, address: &Address) -> Channel;
}
