//! Transport-agnostic channel handle.
//!
//! A transport implementation only writes a driver future that talks to its
//! socket through [`ChannelIo`]. `ChannelIo` normalizes the lifecycle so every
//! transport produces the same event sequence:
//!
//! ```text
//! [Opened] Frame* (Closed | Error)
//! ```
//!
//! At most one `Opened`, exactly one terminal event, nothing after it.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use tokio::{sync::mpsc, task::JoinHandle};
use uuid::Uuid;

use crate::{Envelope, TransportKind, traits::TransportError};

const PENDING: u8 = 0;
const OPEN: u8 = 1;
const CLOSED: u8 = 2;

/// How long an open channel gets to close its socket gracefully.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Lifecycle event of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The transport is ready; sends are accepted from now on.
    Opened,
    /// An inbound envelope.
    Frame(Envelope),
    /// The channel closed (peer close, EOF or local close).
    Closed(String),
    /// The channel failed: open failure, connect timeout, or a drop after
    /// opening.
    Error(TransportError),
}

impl ChannelEvent {
    /// Whether this event ends the channel.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed(_) | Self::Error(_))
    }
}

/// Handle to one open attempt of one transport.
///
/// Dropping the handle cancels the attempt and closes the socket.
pub struct Channel {
    id: Uuid,
    kind: TransportKind,
    phase: Arc<AtomicU8>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    outbound: Option<mpsc::UnboundedSender<Envelope>>,
    task: Option<JoinHandle<()>>,
    finished: bool,
}

impl Channel {
    /// Spawn `driver` and return the handle observing it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<F, Fut>(kind: TransportKind, driver: F) -> Self
    where
        F: FnOnce(ChannelIo) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let phase = Arc::new(AtomicU8::new(PENDING));
        let (events_tx, events) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let io = ChannelIo {
            id,
            kind,
            phase: Arc::clone(&phase),
            events: events_tx,
            outbound: outbound_rx,
            terminated: false,
        };
        let task = tokio::spawn(driver(io));

        Self {
            id,
            kind,
            phase,
            events,
            outbound: Some(outbound_tx),
            task: Some(task),
            finished: false,
        }
    }

    /// Unique id of this attempt, for logs.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Transport this channel belongs to.
    #[must_use]
    pub const fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Whether the channel reported `Opened` and has not closed since.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.phase.load(Ordering::Acquire) == OPEN
    }

    /// Next lifecycle event.
    ///
    /// Returns `None` once the terminal event has been delivered or after
    /// [`close`](Self::close).
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        if self.finished {
            return None;
        }
        let event = self.events.recv().await;
        match &event {
            Some(ev) if ev.is_terminal() => self.finished = true,
            None => self.finished = true,
            Some(_) => {}
        }
        event
    }

    /// Queue an envelope on the socket.
    ///
    /// # Errors
    /// Returns [`TransportError::NotOpen`] before `Opened` or after the
    /// channel closed.
    pub fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        self.outbound
            .as_ref()
            .ok_or(TransportError::NotOpen)?
            .send(envelope)
            .map_err(|_| TransportError::NotOpen)
    }

    /// Close the channel. Idempotent.
    ///
    /// An attempt that has not opened yet is cancelled immediately; an open
    /// channel is given a short grace period to close its socket cleanly.
    pub fn close(&mut self) {
        let previous = self.phase.swap(CLOSED, Ordering::AcqRel);
        self.finished = true;
        self.outbound = None;

        let Some(task) = self.task.take() else {
            return;
        };
        if previous != OPEN || task.is_finished() {
            task.abort();
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let abort = task.abort_handle();
                    if tokio::time::timeout(CLOSE_GRACE, task).await.is_err() {
                        abort.abort();
                    }
                });
            }
            Err(_) => task.abort(),
        }
        tracing::debug!(channel = %self.id, kind = %self.kind, "Channel closed locally");
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

/// Driver side of a [`Channel`].
pub struct ChannelIo {
    id: Uuid,
    kind: TransportKind,
    phase: Arc<AtomicU8>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    outbound: mpsc::UnboundedReceiver<Envelope>,
    terminated: bool,
}

impl ChannelIo {
    /// Id of the owning channel.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Transport kind of the owning channel.
    #[must_use]
    pub const fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Whether the owner closed the channel.
    #[must_use]
    pub fn is_closed_locally(&self) -> bool {
        self.phase.load(Ordering::Acquire) == CLOSED
    }

    /// Report the transport ready.
    ///
    /// Returns `false` if the owner closed the channel in the meantime; the
    /// driver should then shut the socket and return.
    pub fn opened(&mut self) -> bool {
        if self.terminated {
            return false;
        }
        if self
            .phase
            .compare_exchange(PENDING, OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let _ = self.events.send(ChannelEvent::Opened);
        true
    }

    /// Deliver an inbound text frame.
    ///
    /// Malformed frames are logged and dropped; they never end the channel.
    pub fn frame_text(&self, text: &str) {
        match Envelope::decode(text) {
            Ok(envelope) => self.frame(envelope),
            Err(e) => {
                tracing::warn!(channel = %self.id, kind = %self.kind, "Dropping frame: {e}");
            }
        }
    }

    /// Deliver an inbound envelope.
    pub fn frame(&self, envelope: Envelope) {
        if self.terminated || self.phase.load(Ordering::Acquire) != OPEN {
            return;
        }
        let _ = self.events.send(ChannelEvent::Frame(envelope));
    }

    /// Report a clean close. Only the first terminal report is delivered.
    pub fn closed(&mut self, reason: impl Into<String>) {
        self.terminate(ChannelEvent::Closed(reason.into()));
    }

    /// Report a failure. Only the first terminal report is delivered.
    ///
    /// Before `Opened` this is [`TransportError::OpenFailed`], afterwards
    /// [`TransportError::Dropped`].
    pub fn error(&mut self, detail: impl Into<String>) {
        let reason = detail.into();
        let kind = self.kind;
        let error = if self.phase.load(Ordering::Acquire) == OPEN {
            TransportError::Dropped { kind, reason }
        } else {
            TransportError::OpenFailed { kind, reason }
        };
        self.terminate(ChannelEvent::Error(error));
    }

    /// Report that the open phase ran past its bound.
    pub fn timed_out(&mut self, after: Duration) {
        let kind = self.kind;
        self.terminate(ChannelEvent::Error(TransportError::Timeout { kind, after }));
    }

    /// Next envelope the owner wants sent.
    ///
    /// Returns `None` when the owner closed the channel.
    pub async fn next_outbound(&mut self) -> Option<Envelope> {
        self.outbound.recv().await
    }

    fn terminate(&mut self, event: ChannelEvent) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        let previous = self.phase.swap(CLOSED, Ordering::AcqRel);
        if previous == CLOSED {
            // The owner already closed; it is no longer listening.
            return;
        }
        tracing::debug!(channel = %self.id, kind = %self.kind, ?event, "Channel terminated");
        let _ = self.events.send(event);
    }
}

impl Drop for ChannelIo {
    fn drop(&mut self) {
        if !self.terminated {
            self.terminate(ChannelEvent::Closed("transport task ended".to_string()));
        }
    }
}
