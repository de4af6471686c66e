//! Scripted in-memory transport for tests (feature: mock).
//!
//! Each `open` consumes the next [`Step`] of the plan (or the default step
//! once the plan runs out). Tests drive the live channel from outside:
//! inject inbound frames, drop the connection, and inspect what was sent
//! and how many channels their owner closed.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use exo_core::{Address, Channel, ChannelIo, Envelope, Transport, TransportKind};
use tokio::sync::mpsc;

/// What one open attempt does.
#[derive(Debug, Clone)]
pub enum Step {
    /// Report `Opened` after the delay.
    Open(Duration),
    /// Report an error after the delay.
    Fail(Duration),
    /// Never open; only cancellation ends the attempt.
    Hang,
}

enum Control {
    Inject(Envelope),
    InjectRaw(String),
    Drop(String),
}

#[derive(Default)]
struct Shared {
    plan: Mutex<VecDeque<Step>>,
    sent: Mutex<Vec<Envelope>>,
    live: Mutex<Option<mpsc::UnboundedSender<Control>>>,
    attempts: AtomicUsize,
    closed: AtomicUsize,
}

/// Counts the channel as closed by its owner when dropped, unless the
/// script ended it first. Dropping covers aborted attempts too.
struct CloseWatch {
    shared: Arc<Shared>,
    scripted_end: bool,
}

impl Drop for CloseWatch {
    fn drop(&mut self) {
        if !self.scripted_end {
            self.shared.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Transport whose behaviour is scripted by the test.
#[derive(Clone)]
pub struct MockTransport {
    kind: TransportKind,
    default_step: Step,
    shared: Arc<Shared>,
}

impl MockTransport {
    /// A transport that opens immediately on every attempt.
    #[must_use]
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            default_step: Step::Open(Duration::ZERO),
            shared: Arc::default(),
        }
    }

    /// Queue steps consumed by the next attempts, in order.
    #[must_use]
    pub fn with_plan(self, steps: impl IntoIterator<Item = Step>) -> Self {
        if let Ok(mut plan) = self.shared.plan.lock() {
            plan.extend(steps);
        }
        self
    }

    /// Step used once the plan is exhausted.
    #[must_use]
    pub fn otherwise(mut self, step: Step) -> Self {
        self.default_step = step;
        self
    }

    /// Number of `open` calls so far.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Channels closed or cancelled by their owner, pending or open.
    #[must_use]
    pub fn closed(&self) -> usize {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Envelopes that reached the wire, across all channels.
    #[must_use]
    pub fn sent(&self) -> Vec<Envelope> {
        self.shared.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Deliver an inbound envelope on the live channel.
    pub fn inject(&self, envelope: Envelope) -> bool {
        self.control(Control::Inject(envelope))
    }

    /// Deliver a raw inbound text frame on the live channel.
    pub fn inject_raw(&self, frame: impl Into<String>) -> bool {
        self.control(Control::InjectRaw(frame.into()))
    }

    /// Fail the live channel as if the socket dropped.
    pub fn drop_connection(&self, reason: impl Into<String>) -> bool {
        self.control(Control::Drop(reason.into()))
    }

    fn control(&self, msg: Control) -> bool {
        self.shared
            .live
            .lock()
            .ok()
            .and_then(|live| live.as_ref().map(|tx| tx.send(msg).is_ok()))
            .unwrap_or(false)
    }

    fn next_step(&self) -> Step {
        self.shared
            .plan
            .lock()
            .ok()
            .and_then(|mut plan| plan.pop_front())
            .unwrap_or_else(|| self.default_step.clone())
    }
}

impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn open(&self, _address: &Address) -> Channel {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);
        let step = self.next_step();
        let watch = CloseWatch {
            shared: Arc::clone(&self.shared),
            scripted_end: false,
        };
        Channel::spawn(self.kind, move |io| drive(io, step, watch))
    }
}

async fn drive(mut io: ChannelIo, step: Step, mut watch: CloseWatch) {
    let shared = Arc::clone(&watch.shared);
    match step {
        Step::Open(delay) => tokio::time::sleep(delay).await,
        Step::Fail(delay) => {
            tokio::time::sleep(delay).await;
            watch.scripted_end = true;
            io.error("scripted failure");
            return;
        }
        Step::Hang => std::future::pending::<()>().await,
    }

    let (control_tx, mut control_rx) = mpsc::unbounded_channel();
    if let Ok(mut live) = shared.live.lock() {
        *live = Some(control_tx);
    }
    if !io.opened() {
        return;
    }

    loop {
        tokio::select! {
            outbound = io.next_outbound() => {
                let Some(envelope) = outbound else {
                    io.closed("closed by client");
                    return;
                };
                if let Ok(mut sent) = shared.sent.lock() {
                    sent.push(envelope);
                }
            }
            control = control_rx.recv() => match control {
                Some(Control::Inject(envelope)) => io.frame(envelope),
                Some(Control::InjectRaw(text)) => io.frame_text(&text),
                Some(Control::Drop(reason)) => {
                    watch.scripted_end = true;
                    io.error(reason);
                    return;
                }
                None => {
                    // A newer channel of this transport took over the controls.
                    watch.scripted_end = true;
                    return;
                }
            },
        }
    }
}
