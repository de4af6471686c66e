//! Candidates found during discovery and their health results.

use std::{fmt, time::Duration};

use exo_core::Address;
use serde::{Deserialize, Serialize};

/// A backend instance that has not been verified yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
    /// Stable identity, persisted as "last used".
    pub id: String,
    pub display_name: String,
    /// Where the candidate should be listening.
    pub address: Address,
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.address)
    }
}

/// Outcome of probing one port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthOutcome {
    Reachable(Duration),
    Refused(String),
    TimedOut(Duration),
}

impl HealthOutcome {
    #[must_use]
    pub const fn is_reachable(&self) -> bool {
        matches!(self, Self::Reachable(_))
    }
}

impl fmt::Display for HealthOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reachable(latency) => write!(f, "reachable in {}ms", latency.as_millis()),
            Self::Refused(reason) => write!(f, "refused: {reason}"),
            Self::TimedOut(bound) => write!(f, "timed out after {}ms", bound.as_millis()),
        }
    }
}

/// Probe result for one port of one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthResult {
    pub candidate_id: String,
    pub port: u16,
    pub outcome: HealthOutcome,
}

/// A candidate that failed its health check, with why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub candidate: Candidate,
    pub reasons: Vec<String>,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.candidate, self.reasons.join(", "))
    }
}
