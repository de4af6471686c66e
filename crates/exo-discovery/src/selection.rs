//! Choosing a backend from health-checked candidates.

use std::collections::HashMap;

use crate::candidate::{Candidate, HealthResult, Rejection};

/// Result of [`select`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Use this candidate without asking.
    Auto(Candidate),
    /// Ask the user; the last-used candidate, if eligible, comes first.
    Choose(Vec<Candidate>),
    /// Nothing passed its health check.
    Unreachable(Vec<Rejection>),
}

/// Split candidates into eligible ones and rejections.
///
/// A candidate is eligible only if every probed port was reachable. A
/// candidate with no results at all is rejected.
#[must_use]
pub fn partition(
    candidates: Vec<Candidate>,
    results: &[HealthResult],
) -> (Vec<Candidate>, Vec<Rejection>) {
    let mut by_candidate: HashMap<&str, Vec<&HealthResult>> = HashMap::new();
    for result in results {
        by_candidate
            .entry(result.candidate_id.as_str())
            .or_default()
            .push(result);
    }

    let mut eligible = Vec::new();
    let mut rejected = Vec::new();
    for candidate in candidates {
        let probes = by_candidate.get(candidate.id.as_str());
        let mut reasons: Vec<String> = probes
            .into_iter()
            .flatten()
            .filter(|r| !r.outcome.is_reachable())
            .map(|r| format!("port {} {}", r.port, r.outcome))
            .collect();
        if probes.is_none_or(Vec::is_empty) {
            reasons.push("not probed".to_string());
        }

        if reasons.is_empty() {
            eligible.push(candidate);
        } else {
            reasons.sort();
            rejected.push(Rejection { candidate, reasons });
        }
    }
    (eligible, rejected)
}

/// Apply the selection rule.
///
/// Exactly one eligible candidate is used directly when it is the last-used
/// one or nothing was used before. Anything else is left to the user.
#[must_use]
pub fn select(
    candidates: Vec<Candidate>,
    results: &[HealthResult],
    last_used: Option<&str>,
) -> Selection {
    let (mut eligible, rejected) = partition(candidates, results);
    match eligible.len() {
        0 => Selection::Unreachable(rejected),
        1 if last_used.is_none_or(|id| id == eligible[0].id) => {
            Selection::Auto(eligible.remove(0))
        }
        _ => {
            let previous = last_used.and_then(|id| eligible.iter().position(|c| c.id == id));
            if let Some(pos) = previous {
                let candidate = eligible.remove(pos);
                eligible.insert(0, candidate);
            }
            Selection::Choose(eligible)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use exo_core::Address;

    use super::*;
    use crate::candidate::HealthOutcome;

    fn candidate(id: &str, port: u16) -> Candidate {
        Candidate {
            id: id.to_string(),
            display_name: format!("backend {id}"),
            address: Address::new("localhost", port, port + 1),
        }
    }

    fn healthy(c: &Candidate) -> Vec<HealthResult> {
        c.address
            .ports()
            .into_iter()
            .map(|port| HealthResult {
                candidate_id: c.id.clone(),
                port,
                outcome: HealthOutcome::Reachable(Duration::from_millis(3)),
            })
            .collect()
    }

    #[test]
    fn test_single_healthy_without_history_is_auto() {
        let a = candidate("a", 9000);
        let results = healthy(&a);
        assert_eq!(select(vec![a.clone()], &results, None), Selection::Auto(a));
    }

    #[test]
    fn test_single_healthy_matching_history_is_auto() {
        let a = candidate("a", 9000);
        let results = healthy(&a);
        assert_eq!(
            select(vec![a.clone()], &results, Some("a")),
            Selection::Auto(a)
        );
    }

    #[test]
    fn test_single_healthy_other_than_history_asks() {
        let a = candidate("a", 9000);
        let results = healthy(&a);
        assert_eq!(
            select(vec![a.clone()], &results, Some("gone")),
            Selection::Choose(vec![a])
        );
    }

    #[test]
    fn test_several_healthy_ask_with_last_used_first() {
        let (a, b) = (candidate("a", 9000), candidate("b", 9100));
        let mut results = healthy(&a);
        results.extend(healthy(&b));
        assert_eq!(
            select(vec![a.clone(), b.clone()], &results, Some("b")),
            Selection::Choose(vec![b, a])
        );
    }

    #[test]
    fn test_half_open_candidate_is_rejected() {
        let a = candidate("a", 9000);
        let results = vec![
            HealthResult {
                candidate_id: "a".to_string(),
                port: 9000,
                outcome: HealthOutcome::Reachable(Duration::from_millis(1)),
            },
            HealthResult {
                candidate_id: "a".to_string(),
                port: 9001,
                outcome: HealthOutcome::TimedOut(Duration::from_secs(1)),
            },
        ];
        let Selection::Unreachable(rejected) = select(vec![a], &results, None) else {
            panic!("expected no eligible candidate");
        };
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].reasons, ["port 9001 timed out after 1000ms"]);
    }

    #[test]
    fn test_unprobed_candidate_is_rejected() {
        let (eligible, rejected) = partition(vec![candidate("a", 9000)], &[]);
        assert!(eligible.is_empty());
        assert_eq!(rejected[0].reasons, ["not probed"]);
    }
}
