//! Health checks: bounded TCP reachability probes.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{net::TcpStream, task::JoinSet, time::Instant};

use crate::candidate::{Candidate, HealthOutcome, HealthResult};

/// Default bound for a single probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Checks whether something accepts connections on a port.
#[async_trait]
pub trait PortProber: Send + Sync {
    async fn probe(&self, host: &str, port: u16) -> HealthOutcome;
}

/// Connect-and-close TCP probe.
#[derive(Debug, Clone, Copy)]
pub struct TcpProber {
    timeout: Duration,
}

impl TcpProber {
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpProber {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

#[async_trait]
impl PortProber for TcpProber {
    async fn probe(&self, host: &str, port: u16) -> HealthOutcome {
        let started = Instant::now();
        match tokio::time::timeout(self.timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => {
                drop(stream);
                HealthOutcome::Reachable(started.elapsed())
            }
            Ok(Err(e)) => HealthOutcome::Refused(e.to_string()),
            Err(_) => HealthOutcome::TimedOut(self.timeout),
        }
    }
}

/// Probe both ports of every candidate concurrently.
///
/// Dropping the returned future aborts every probe still in flight.
pub async fn check_all(prober: Arc<dyn PortProber>, candidates: &[Candidate]) -> Vec<HealthResult> {
    let mut probes = JoinSet::new();
    for candidate in candidates {
        for port in candidate.address.ports() {
            let prober = Arc::clone(&prober);
            let host = candidate.address.host.clone();
            let candidate_id = candidate.id.clone();
            probes.spawn(async move {
                let outcome = prober.probe(&host, port).await;
                HealthResult {
                    candidate_id,
                    port,
                    outcome,
                }
            });
        }
    }

    let mut results = Vec::with_capacity(probes.len());
    while let Some(joined) = probes.join_next().await {
        match joined {
            Ok(result) => {
                if !result.outcome.is_reachable() {
                    tracing::warn!(
                        candidate = %result.candidate_id,
                        port = result.port,
                        "Health check failed: {}",
                        result.outcome
                    );
                }
                results.push(result);
            }
            Err(e) => tracing::error!("Probe task failed: {e}"),
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use exo_core::Address;
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn test_tcp_probe_reachable_and_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let closed = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };

        let prober = TcpProber::default();
        assert!(prober.probe("127.0.0.1", open).await.is_reachable());
        assert!(matches!(
            prober.probe("127.0.0.1", closed).await,
            HealthOutcome::Refused(_)
        ));
    }

    #[tokio::test]
    async fn test_check_all_covers_every_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let candidates = vec![
            Candidate {
                id: "one".to_string(),
                display_name: "one".to_string(),
                address: Address::new("127.0.0.1", open, open),
            },
            Candidate {
                id: "two".to_string(),
                display_name: "two".to_string(),
                address: Address::new("127.0.0.1", open, open),
            },
        ];

        let results = check_all(Arc::new(TcpProber::default()), &candidates).await;
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.outcome.is_reachable()));
    }
}
