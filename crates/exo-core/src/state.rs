//! Connection state of a session.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Coarse status of the one logical session a connection manager owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No session; nothing in flight.
    Disconnected,
    /// First connection attempt(s) for an address.
    Connecting,
    /// A transport is open and sends go straight to it.
    Connected,
    /// The active transport dropped and is being replaced.
    Reconnecting,
    /// Retry budget exhausted. Only an explicit reconnect, a new start or a
    /// close leaves this state.
    Failed,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is a permitted edge.
    ///
    /// `close()` may move any state to `Disconnected`, and an explicit
    /// reconnect moves `Failed` back to `Connecting`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (_, Self::Disconnected)
                | (Self::Disconnected | Self::Failed, Self::Connecting)
                | (Self::Connecting | Self::Reconnecting, Self::Connected | Self::Failed)
                | (Self::Connected, Self::Reconnecting)
        ) && !matches!((self, next), (Self::Disconnected, Self::Disconnected))
    }

    /// Whether the session is trying to (re)establish a transport.
    #[must_use]
    pub const fn is_pending(self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionState::{self, *};

    const ALL: [ConnectionState; 5] = [Disconnected, Connecting, Connected, Reconnecting, Failed];

    #[test]
    fn test_permitted_edges() {
        let permitted = [
            (Disconnected, Connecting),
            (Connecting, Connected),
            (Connecting, Failed),
            (Connected, Reconnecting),
            (Reconnecting, Connected),
            (Reconnecting, Failed),
            (Failed, Connecting),
            (Connecting, Disconnected),
            (Connected, Disconnected),
            (Reconnecting, Disconnected),
            (Failed, Disconnected),
        ];

        for from in ALL {
            for to in ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    permitted.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }
}
