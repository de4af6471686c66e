//! Per-type dispatch of inbound envelopes.

use std::{
    collections::HashMap,
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use exo_core::Envelope;
use futures::{Stream, StreamExt};

/// Callback invoked for each matching envelope.
pub type Handler = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Token returned by [`EnvelopeRouter::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Routes inbound envelopes to the handlers registered for their type.
///
/// Handlers for one type run in registration order. Envelopes with no
/// handler are logged and dropped.
#[derive(Default)]
pub struct EnvelopeRouter {
    handlers: RwLock<HashMap<String, Vec<(HandlerId, Handler)>>>,
    next_id: AtomicU64,
}

impl EnvelopeRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for envelopes of type `kind`.
    pub fn register<F>(&self, kind: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut handlers) = self.handlers.write() {
            handlers
                .entry(kind.into())
                .or_default()
                .push((id, Arc::new(handler)));
        }
        id
    }

    /// Remove a handler. Returns whether it was registered.
    pub fn unregister(&self, id: HandlerId) -> bool {
        let Ok(mut handlers) = self.handlers.write() else {
            return false;
        };
        let mut found = false;
        handlers.retain(|_, list| {
            let before = list.len();
            list.retain(|(h, _)| *h != id);
            found |= list.len() != before;
            !list.is_empty()
        });
        found
    }

    /// Invoke every handler for the envelope's type. Returns how many ran.
    pub fn dispatch(&self, envelope: &Envelope) -> usize {
        // Snapshot so handlers may register or unregister while running.
        let matching: Vec<Handler> = self
            .handlers
            .read()
            .ok()
            .and_then(|handlers| {
                handlers
                    .get(&envelope.kind)
                    .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            })
            .unwrap_or_default();

        if matching.is_empty() {
            tracing::debug!(kind = %envelope.kind, "No handler for envelope");
        }
        for handler in &matching {
            handler(envelope);
        }
        matching.len()
    }

    /// Dispatch everything from `stream` until it ends.
    pub fn spawn_dispatcher<S>(self: Arc<Self>, stream: S) -> tokio::task::JoinHandle<()>
    where
        S: Stream<Item = Envelope> + Send + 'static,
    {
        tokio::spawn(async move {
            tokio::pin!(stream);

            while let Some(envelope) = stream.next().await {
                self.dispatch(&envelope);
            }
        })
    }
}

impl std::fmt::Debug for EnvelopeRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<String> = self
            .handlers
            .read()
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("EnvelopeRouter")
            .field("kinds", &kinds)
            .finish_non_exhaustive()
    }
}
