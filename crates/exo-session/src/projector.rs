//! Projects connection state and backend activity onto one display state.

use std::{fmt, str::FromStr};

use exo_core::{ConnectionState, Envelope, envelope::DOT_STATE};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{broadcast::error::RecvError, watch},
    task::JoinHandle,
};

use crate::manager::ConnectionManager;

/// What the status indicator shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayState {
    #[default]
    Idle,
    Listening,
    Processing,
    Speaking,
    Error,
}

impl DisplayState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Speaking => "speaking",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for DisplayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognized `dot_state` value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown display state: {0}")]
pub struct UnknownDisplayState(pub String);

impl FromStr for DisplayState {
    type Err = UnknownDisplayState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "listening" => Ok(Self::Listening),
            "processing" => Ok(Self::Processing),
            "speaking" => Ok(Self::Speaking),
            "error" => Ok(Self::Error),
            other => Err(UnknownDisplayState(other.to_string())),
        }
    }
}

/// Pure projection of connection state plus the backend's last `dot_state`.
///
/// | connection                 | display             |
/// |----------------------------|---------------------|
/// | Disconnected               | Idle                |
/// | Connecting, Reconnecting   | Processing          |
/// | Connected                  | last `dot_state`    |
/// | Failed                     | Error               |
#[derive(Debug, Clone)]
pub struct UiStateProjector {
    connection: ConnectionState,
    activity: DisplayState,
}

impl Default for UiStateProjector {
    fn default() -> Self {
        Self::new()
    }
}

impl UiStateProjector {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            activity: DisplayState::Idle,
        }
    }

    /// Current display state.
    #[must_use]
    pub const fn current(&self) -> DisplayState {
        match self.connection {
            ConnectionState::Disconnected => DisplayState::Idle,
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                DisplayState::Processing
            }
            ConnectionState::Connected => self.activity,
            ConnectionState::Failed => DisplayState::Error,
        }
    }

    /// Apply a connection state change. Returns the new display state if it
    /// changed.
    pub fn on_status(&mut self, state: ConnectionState) -> Option<DisplayState> {
        let before = self.current();
        if self.connection == ConnectionState::Connected && state != ConnectionState::Connected {
            // Backend activity does not survive the connection.
            self.activity = DisplayState::Idle;
        }
        self.connection = state;
        changed(before, self.current())
    }

    /// Apply an inbound envelope. Only `dot_state` envelopes matter.
    pub fn on_envelope(&mut self, envelope: &Envelope) -> Option<DisplayState> {
        if !envelope.is(DOT_STATE) {
            return None;
        }
        let Some(raw) = envelope.payload.get("state").and_then(|v| v.as_str()) else {
            tracing::warn!("dot_state envelope without a state");
            return None;
        };
        match raw.parse::<DisplayState>() {
            Ok(activity) => {
                let before = self.current();
                self.activity = activity;
                changed(before, self.current())
            }
            Err(e) => {
                tracing::warn!("{e}");
                None
            }
        }
    }
}

fn changed(before: DisplayState, after: DisplayState) -> Option<DisplayState> {
    (before != after).then_some(after)
}

/// Feed a projector from `manager` and publish the display state.
///
/// The task ends when the manager's driver stops.
#[must_use]
pub fn spawn_projector(manager: &ConnectionManager) -> (watch::Receiver<DisplayState>, JoinHandle<()>) {
    let mut status = manager.subscribe_status();
    let mut frames = manager.frames();
    let mut projector = UiStateProjector::new();
    projector.on_status(manager.status());
    let (tx, rx) = watch::channel(projector.current());

    let handle = tokio::spawn(async move {
        loop {
            let update = tokio::select! {
                state = status.recv() => match state {
                    Ok(state) => projector.on_status(state),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Projector lagged behind status changes");
                        None
                    }
                    Err(RecvError::Closed) => break,
                },
                frame = frames.recv() => match frame {
                    Ok(envelope) => projector.on_envelope(&envelope),
                    Err(RecvError::Lagged(_)) => None,
                    Err(RecvError::Closed) => break,
                },
            };
            if let Some(new_state) = update {
                tracing::debug!(display = %new_state, "Display state changed");
                if tx.send(new_state).is_err() {
                    break;
                }
            }
        }
    });
    (rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_mapping() {
        let mut p = UiStateProjector::new();
        assert_eq!(p.current(), DisplayState::Idle);
        assert_eq!(
            p.on_status(ConnectionState::Connecting),
            Some(DisplayState::Processing)
        );
        assert_eq!(p.on_status(ConnectionState::Connected), Some(DisplayState::Idle));
        assert_eq!(p.on_status(ConnectionState::Reconnecting), Some(DisplayState::Processing));
        assert_eq!(p.on_status(ConnectionState::Failed), Some(DisplayState::Error));
        assert_eq!(p.on_status(ConnectionState::Disconnected), Some(DisplayState::Idle));
    }

    #[test]
    fn test_dot_state_only_shows_while_connected() {
        let mut p = UiStateProjector::new();
        p.on_status(ConnectionState::Connecting);
        assert_eq!(p.on_envelope(&Envelope::dot_state("speaking")), None);

        assert_eq!(
            p.on_status(ConnectionState::Connected),
            Some(DisplayState::Speaking)
        );
        assert_eq!(
            p.on_envelope(&Envelope::dot_state("listening")),
            Some(DisplayState::Listening)
        );
        assert_eq!(p.on_envelope(&Envelope::dot_state("listening")), None);

        // Activity is forgotten once the connection drops.
        p.on_status(ConnectionState::Reconnecting);
        assert_eq!(p.on_status(ConnectionState::Connected), Some(DisplayState::Idle));
    }

    #[test]
    fn test_unknown_and_unrelated_envelopes_are_ignored() {
        let mut p = UiStateProjector::new();
        p.on_status(ConnectionState::Connecting);
        p.on_status(ConnectionState::Connected);
        assert_eq!(p.on_envelope(&Envelope::dot_state("dancing")), None);
        assert_eq!(p.on_envelope(&Envelope::chat("speaking")), None);
        assert_eq!(
            p.on_envelope(&Envelope::new(DOT_STATE, serde_json::json!({}))),
            None
        );
        assert_eq!(p.current(), DisplayState::Idle);
    }

    #[test]
    fn test_display_state_parsing() {
        for state in [
            DisplayState::Idle,
            DisplayState::Listening,
            DisplayState::Processing,
            DisplayState::Speaking,
            DisplayState::Error,
        ] {
            assert_eq!(state.as_str().parse::<DisplayState>(), Ok(state));
        }
        assert!("Idle".parse::<DisplayState>().is_err());
    }
}
