//! Discovery: find running backends, health check them, pick one.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use exo_core::Address;
use thiserror::Error;

use crate::{
    candidate::{Candidate, Rejection},
    probe::{PortProber, check_all},
    runtime::{ContainerRuntime, RuntimeError},
    selection::{Selection, partition, select},
    storage::{LastUsedStore, StorageError},
};

/// Probe rounds for a freshly launched container.
pub const DEFAULT_LAUNCH_READY_ATTEMPTS: u32 = 10;
/// Pause between those rounds.
pub const DEFAULT_LAUNCH_READY_INTERVAL: Duration = Duration::from_secs(1);

/// Discovery error.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("No backend available: {0}")]
    NoBackendAvailable(String),
    #[error("No reachable backend: {}", describe(.0))]
    NoReachableBackend(Vec<Rejection>),
    #[error("Container runtime error: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Unknown candidate: {0}")]
    UnknownCandidate(String),
}

fn describe(rejections: &[Rejection]) -> String {
    rejections
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Discovery tunables.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub launch_ready_attempts: u32,
    pub launch_ready_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            launch_ready_attempts: DEFAULT_LAUNCH_READY_ATTEMPTS,
            launch_ready_interval: DEFAULT_LAUNCH_READY_INTERVAL,
        }
    }
}

/// Outcome of [`Discovery::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Use this address; the choice has been persisted.
    Resolved(Address),
    /// Several candidates qualify. Pass the chosen id to
    /// [`Discovery::confirm`].
    Choose(Vec<Candidate>),
}

/// Backend discovery and health checking.
pub struct Discovery {
    runtime: Arc<dyn ContainerRuntime>,
    prober: Arc<dyn PortProber>,
    store: Arc<dyn LastUsedStore>,
    config: DiscoveryConfig,
    offered: Mutex<Vec<Candidate>>,
}

impl Discovery {
    #[must_use]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        prober: Arc<dyn PortProber>,
        store: Arc<dyn LastUsedStore>,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            runtime,
            prober,
            store,
            config,
            offered: Mutex::new(Vec::new()),
        }
    }

    /// Run one discovery pass.
    ///
    /// Dropping the future cancels every probe in flight.
    ///
    /// # Errors
    /// - [`DiscoveryError::NoBackendAvailable`] if nothing runs and nothing
    ///   could be launched
    /// - [`DiscoveryError::NoReachableBackend`] if every candidate failed its
    ///   health check
    pub async fn resolve(&self) -> Result<Resolution, DiscoveryError> {
        let candidates = self.runtime.list().await?;
        tracing::info!(count = candidates.len(), "Discovered backend candidates");

        if candidates.is_empty() {
            let launched = self.launch().await?;
            let address = self.wait_ready(launched).await?;
            return Ok(Resolution::Resolved(address));
        }

        let results = check_all(Arc::clone(&self.prober), &candidates).await;
        let last_used = self.last_used().await;

        match select(candidates, &results, last_used.as_deref()) {
            Selection::Auto(candidate) => {
                tracing::info!(candidate = %candidate.id, "Selected backend");
                self.persist(&candidate).await?;
                Ok(Resolution::Resolved(candidate.address))
            }
            Selection::Choose(eligible) => {
                tracing::info!(count = eligible.len(), "Several backends qualify, asking");
                if let Ok(mut offered) = self.offered.lock() {
                    offered.clone_from(&eligible);
                }
                Ok(Resolution::Choose(eligible))
            }
            Selection::Unreachable(rejected) => Err(DiscoveryError::NoReachableBackend(rejected)),
        }
    }

    /// Complete a [`Resolution::Choose`] with the candidate the user picked.
    ///
    /// # Errors
    /// Returns [`DiscoveryError::UnknownCandidate`] if `id` was not offered.
    pub async fn confirm(&self, id: &str) -> Result<Address, DiscoveryError> {
        let chosen = self
            .offered
            .lock()
            .ok()
            .and_then(|offered| offered.iter().find(|c| c.id == id).cloned())
            .ok_or_else(|| DiscoveryError::UnknownCandidate(id.to_string()))?;
        self.persist(&chosen).await?;
        if let Ok(mut offered) = self.offered.lock() {
            offered.clear();
        }
        Ok(chosen.address)
    }

    async fn launch(&self) -> Result<Candidate, DiscoveryError> {
        match self.runtime.launch().await {
            Ok(Some(candidate)) => {
                tracing::info!(candidate = %candidate.id, "Launched backend container");
                Ok(candidate)
            }
            Ok(None) => Err(DiscoveryError::NoBackendAvailable(
                "no backend running and no launch template configured".to_string(),
            )),
            Err(e) => Err(DiscoveryError::NoBackendAvailable(format!("launch failed: {e}"))),
        }
    }

    /// Probe a freshly launched candidate until it answers on both ports.
    async fn wait_ready(&self, candidate: Candidate) -> Result<Address, DiscoveryError> {
        let candidates = [candidate];
        let mut rejected = Vec::new();
        for round in 1..=self.config.launch_ready_attempts.max(1) {
            if round > 1 {
                tokio::time::sleep(self.config.launch_ready_interval).await;
            }
            let results = check_all(Arc::clone(&self.prober), &candidates).await;
            let (mut eligible, not_ready) = partition(candidates.to_vec(), &results);
            if let Some(ready) = eligible.pop() {
                self.persist(&ready).await?;
                return Ok(ready.address);
            }
            tracing::debug!(round, candidate = %candidates[0].id, "Launched backend not ready yet");
            rejected = not_ready;
        }
        Err(DiscoveryError::NoReachableBackend(rejected))
    }

    async fn last_used(&self) -> Option<String> {
        match self.store.load().await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!("Ignoring unreadable last used backend: {e}");
                None
            }
        }
    }

    async fn persist(&self, candidate: &Candidate) -> Result<(), DiscoveryError> {
        self.store.save(&candidate.id).await?;
        Ok(())
    }
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discovery")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
