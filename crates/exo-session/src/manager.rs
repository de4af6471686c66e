//! Connection manager: one logical session over two transports.
//!
//! A single driver task owns the state machine, the active channel and the
//! outbound queue. [`ConnectionManager`] handles are cheap clones that talk
//! to the driver over a command channel, so every state change happens in
//! one place and in order.
//!
//! Each attempt races the transports: the primary opens first, the fallback
//! joins after `primary_grace` (or as soon as the primary fails), the first
//! one to open is adopted and the other is closed.

use std::{sync::Arc, time::Duration};

use exo_core::{
    Address, Channel, ChannelEvent, ConnectionState, Envelope, Transport, TransportError,
    TransportKind,
};
use futures::{StreamExt, future, stream::BoxStream};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_stream::wrappers::BroadcastStream;

use crate::{backoff::ReconnectPolicy, queue::OutboundQueue};

/// How long the primary gets before the fallback joins the race.
pub const DEFAULT_PRIMARY_GRACE: Duration = Duration::from_secs(3);
/// Upper bound for a single connection attempt.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

const STATUS_CAPACITY: usize = 64;
const FRAMES_CAPACITY: usize = 256;

/// Connection manager error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManagerError {
    #[error("Retry budget exhausted after {attempts} attempts")]
    RetryBudgetExhausted { attempts: u32 },
    #[error("No address to connect to")]
    NoAddress,
    #[error("Connection manager stopped")]
    Stopped,
}

/// Tunables for the connection manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub primary_grace: Duration,
    pub attempt_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub queue_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            primary_grace: DEFAULT_PRIMARY_GRACE,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            queue_capacity: crate::queue::DEFAULT_QUEUE_CAPACITY,
        }
    }
}

enum Command {
    Start(Address, oneshot::Sender<()>),
    Send(Envelope),
    Close(oneshot::Sender<ConnectionState>),
    Reconnect(oneshot::Sender<Result<(), ManagerError>>),
}

/// Handle to the connection manager.
///
/// The driver task stops once every handle has been dropped.
#[derive(Clone)]
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    status: broadcast::Sender<ConnectionState>,
    frames: broadcast::Sender<Envelope>,
    max_attempts: u32,
}

impl ConnectionManager {
    /// Spawn the driver task.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(
        primary: Arc<dyn Transport>,
        fallback: Arc<dyn Transport>,
        config: ManagerConfig,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (status_tx, _) = broadcast::channel(STATUS_CAPACITY);
        let (frames_tx, _) = broadcast::channel(FRAMES_CAPACITY);
        let max_attempts = config.reconnect.max_attempts;

        let driver = Driver {
            primary,
            fallback,
            queue: OutboundQueue::new(config.queue_capacity),
            config,
            commands: commands_rx,
            state: state_tx,
            status: status_tx.clone(),
            frames: frames_tx.clone(),
            address: None,
            active: None,
        };
        tokio::spawn(driver.run());

        Self {
            commands: commands_tx,
            state: state_rx,
            status: status_tx,
            frames: frames_tx,
            max_attempts,
        }
    }

    /// Begin connecting to `address`.
    ///
    /// Starting again with a different address drops the current session
    /// first. Returns once the driver took the request; watch the status for
    /// the outcome.
    ///
    /// # Errors
    /// Returns [`ManagerError::Stopped`] if the driver is gone.
    pub async fn start(&self, address: Address) -> Result<(), ManagerError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Start(address, tx))?;
        rx.await.map_err(|_| ManagerError::Stopped)
    }

    /// Send an envelope on the active transport, or queue it until one opens.
    ///
    /// # Errors
    /// Returns [`ManagerError::Stopped`] if the driver is gone.
    pub fn send(&self, envelope: Envelope) -> Result<(), ManagerError> {
        self.command(Command::Send(envelope))
    }

    /// Close the session and discard queued envelopes. Idempotent.
    ///
    /// # Errors
    /// Returns [`ManagerError::Stopped`] if the driver is gone.
    pub async fn close(&self) -> Result<ConnectionState, ManagerError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Close(tx))?;
        rx.await.map_err(|_| ManagerError::Stopped)
    }

    /// Reconnect to the last address after `close` or a failure.
    ///
    /// A no-op while already connected or connecting.
    ///
    /// # Errors
    /// Returns [`ManagerError::NoAddress`] if `start` was never called.
    pub async fn reconnect(&self) -> Result<(), ManagerError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Reconnect(tx))?;
        rx.await.map_err(|_| ManagerError::Stopped)?
    }

    /// Current connection state.
    #[must_use]
    pub fn status(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver for every state change, in order.
    #[must_use]
    pub fn subscribe_status(&self) -> broadcast::Receiver<ConnectionState> {
        self.status.subscribe()
    }

    /// Stream of the current state followed by every change.
    #[must_use]
    pub fn status_stream(&self) -> BoxStream<'static, ConnectionState> {
        let live = BroadcastStream::new(self.status.subscribe())
            .filter_map(|res| future::ready(res.ok()));
        let current = self.status();
        futures::stream::once(future::ready(current))
            .chain(live)
            .boxed()
    }

    /// Receiver for inbound envelopes.
    #[must_use]
    pub fn frames(&self) -> broadcast::Receiver<Envelope> {
        self.frames.subscribe()
    }

    /// Stream of inbound envelopes. Lagging subscribers skip ahead.
    #[must_use]
    pub fn frame_stream(&self) -> BoxStream<'static, Envelope> {
        BroadcastStream::new(self.frames.subscribe())
            .filter_map(|res| future::ready(res.ok()))
            .boxed()
    }

    /// Wait until the state satisfies `pred`, returning that state.
    ///
    /// # Errors
    /// Returns [`ManagerError::Stopped`] if the driver stops first.
    pub async fn wait_until(
        &self,
        mut pred: impl FnMut(ConnectionState) -> bool,
    ) -> Result<ConnectionState, ManagerError> {
        let mut state = self.state.clone();
        let seen = state
            .wait_for(|s| pred(*s))
            .await
            .map_err(|_| ManagerError::Stopped)?;
        Ok(*seen)
    }

    /// Wait for the session to settle as connected.
    ///
    /// # Errors
    /// Returns [`ManagerError::RetryBudgetExhausted`] if it failed instead.
    pub async fn connected(&self) -> Result<(), ManagerError> {
        let settled = self
            .wait_until(|s| matches!(s, ConnectionState::Connected | ConnectionState::Failed))
            .await?;
        if settled == ConnectionState::Failed {
            return Err(ManagerError::RetryBudgetExhausted {
                attempts: self.max_attempts,
            });
        }
        Ok(())
    }

    fn command(&self, command: Command) -> Result<(), ManagerError> {
        self.commands.send(command).map_err(|_| ManagerError::Stopped)
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// What the driver loop does next.
enum Flow {
    Continue,
    Stop,
}

enum Attempt {
    Adopted(Channel),
    Failed(String),
    Interrupted(Flow),
}

enum RaceStep {
    Primary(Option<ChannelEvent>),
    Fallback(Option<ChannelEvent>),
    Grace,
    Deadline,
    Command(Option<Command>),
}

enum PumpStep {
    Event(Option<ChannelEvent>),
    Command(Option<Command>),
}

struct Driver {
    primary: Arc<dyn Transport>,
    fallback: Arc<dyn Transport>,
    config: ManagerConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    status: broadcast::Sender<ConnectionState>,
    frames: broadcast::Sender<Envelope>,
    address: Option<Address>,
    queue: OutboundQueue,
    active: Option<Channel>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let flow = match self.current() {
                ConnectionState::Disconnected | ConnectionState::Failed => self.idle().await,
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    self.establish().await
                }
                ConnectionState::Connected => self.pump().await,
            };
            if matches!(flow, Flow::Stop) {
                break;
            }
        }
        self.drop_active();
        tracing::debug!("Connection manager stopped");
    }

    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Move to `next`, publishing the change. Same-state moves are no-ops.
    fn transition(&mut self, next: ConnectionState) {
        let current = self.current();
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            tracing::error!(from = %current, to = %next, "Refusing illegal state transition");
            return;
        }
        tracing::info!(from = %current, to = %next, "Connection state changed");
        self.state.send_replace(next);
        let _ = self.status.send(next);
    }

    fn enqueue(&mut self, envelope: Envelope) {
        if let Some(evicted) = self.queue.push(envelope) {
            tracing::warn!(
                kind = %evicted.kind,
                capacity = self.config.queue_capacity,
                dropped_total = self.queue.dropped(),
                "Outbound queue full, dropped oldest envelope"
            );
        }
    }

    fn drop_active(&mut self) {
        if let Some(mut channel) = self.active.take() {
            channel.close();
        }
    }

    fn shut_down_session(&mut self) {
        self.drop_active();
        let discarded = self.queue.clear();
        if discarded > 0 {
            tracing::debug!(discarded, "Discarded queued envelopes on close");
        }
        self.transition(ConnectionState::Disconnected);
    }

    /// Disconnected or Failed: wait for someone to ask for a connection.
    async fn idle(&mut self) -> Flow {
        let Some(command) = self.commands.recv().await else {
            return Flow::Stop;
        };
        match command {
            Command::Start(address, ack) => {
                tracing::info!(%address, "Starting session");
                self.address = Some(address);
                self.transition(ConnectionState::Connecting);
                let _ = ack.send(());
            }
            Command::Send(envelope) => self.enqueue(envelope),
            Command::Close(ack) => {
                self.shut_down_session();
                let _ = ack.send(ConnectionState::Disconnected);
            }
            Command::Reconnect(ack) => {
                if self.address.is_some() {
                    self.transition(ConnectionState::Connecting);
                    let _ = ack.send(Ok(()));
                } else {
                    let _ = ack.send(Err(ManagerError::NoAddress));
                }
            }
        }
        Flow::Continue
    }

    /// Handle a command while an attempt or a backoff wait is in progress.
    ///
    /// Returns `Some` when the command ends the current attempt.
    fn interrupt(&mut self, command: Command) -> Option<Flow> {
        match command {
            Command::Send(envelope) => {
                self.enqueue(envelope);
                None
            }
            Command::Close(ack) => {
                self.shut_down_session();
                let _ = ack.send(ConnectionState::Disconnected);
                Some(Flow::Continue)
            }
            Command::Start(address, ack) => {
                let restart = self.restart(address);
                let _ = ack.send(());
                restart.then_some(Flow::Continue)
            }
            Command::Reconnect(ack) => {
                let _ = ack.send(Ok(()));
                None
            }
        }
    }

    /// Switch to a new address, going through Disconnected.
    ///
    /// Returns `false` when `address` is the one already in use.
    fn restart(&mut self, address: Address) -> bool {
        if self.address.as_ref() == Some(&address) {
            return false;
        }
        tracing::info!(%address, "Restarting session with a new address");
        self.drop_active();
        self.address = Some(address);
        self.transition(ConnectionState::Disconnected);
        self.transition(ConnectionState::Connecting);
        true
    }

    /// Connecting or Reconnecting: run attempts until one opens or the
    /// budget is spent.
    async fn establish(&mut self) -> Flow {
        let Some(address) = self.address.clone() else {
            self.transition(ConnectionState::Disconnected);
            return Flow::Continue;
        };
        let policy = self.config.reconnect;
        // A fresh connect tries once right away; a reconnect always waits.
        let immediate = self.current() == ConnectionState::Connecting;

        let mut attempt = 0;
        while !policy.exhausted(attempt) {
            attempt += 1;
            let retry = if immediate { attempt - 1 } else { attempt };
            let delay = policy.delay_for(retry);
            if !delay.is_zero() {
                tracing::debug!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Waiting before connection attempt"
                );
                if let Some(flow) = self.backoff(delay).await {
                    return flow;
                }
            }

            match self.attempt(&address).await {
                Attempt::Adopted(channel) => {
                    self.adopt(channel);
                    return Flow::Continue;
                }
                Attempt::Failed(reason) => {
                    tracing::warn!(
                        attempt,
                        max_attempts = policy.max_attempts,
                        %address,
                        "Connection attempt failed: {reason}"
                    );
                }
                Attempt::Interrupted(flow) => return flow,
            }
        }

        tracing::error!(
            %address,
            "{}",
            ManagerError::RetryBudgetExhausted {
                attempts: policy.max_attempts
            }
        );
        self.transition(ConnectionState::Failed);
        Flow::Continue
    }

    /// Sleep for `delay`, still serving commands.
    async fn backoff(&mut self, delay: Duration) -> Option<Flow> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => return None,
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        return Some(Flow::Stop);
                    };
                    if let Some(flow) = self.interrupt(command) {
                        return Some(flow);
                    }
                }
            }
        }
    }

    /// One race between the transports.
    async fn attempt(&mut self, address: &Address) -> Attempt {
        let mut primary = Some(self.primary.open(address));
        let mut fallback: Option<Channel> = None;
        let mut fallback_started = false;
        let mut failures: Vec<String> = Vec::new();

        let grace = tokio::time::sleep(self.config.primary_grace);
        let deadline = tokio::time::sleep(self.config.attempt_timeout);
        tokio::pin!(grace);
        tokio::pin!(deadline);

        loop {
            let step = tokio::select! {
                event = next_event(&mut primary) => RaceStep::Primary(event),
                event = next_event(&mut fallback) => RaceStep::Fallback(event),
                () = &mut grace, if !fallback_started => RaceStep::Grace,
                () = &mut deadline => RaceStep::Deadline,
                command = self.commands.recv() => RaceStep::Command(command),
            };

            match step {
                RaceStep::Primary(Some(ChannelEvent::Opened)) => {
                    close_slot(&mut fallback);
                    if let Some(channel) = primary.take() {
                        return Attempt::Adopted(channel);
                    }
                }
                RaceStep::Fallback(Some(ChannelEvent::Opened)) => {
                    close_slot(&mut primary);
                    if let Some(channel) = fallback.take() {
                        return Attempt::Adopted(channel);
                    }
                }
                RaceStep::Primary(Some(ChannelEvent::Frame(_)))
                | RaceStep::Fallback(Some(ChannelEvent::Frame(_))) => {}
                RaceStep::Primary(ended) => {
                    failures.push(end_error(TransportKind::Primary, ended).to_string());
                    primary = None;
                    if !fallback_started {
                        tracing::debug!("Primary failed early, racing fallback");
                        fallback = Some(self.fallback.open(address));
                        fallback_started = true;
                    } else if fallback.is_none() {
                        return Attempt::Failed(failures.join("; "));
                    }
                }
                RaceStep::Fallback(ended) => {
                    failures.push(end_error(TransportKind::Fallback, ended).to_string());
                    fallback = None;
                    if primary.is_none() {
                        return Attempt::Failed(failures.join("; "));
                    }
                }
                RaceStep::Grace => {
                    tracing::debug!(
                        grace_ms = u64::try_from(self.config.primary_grace.as_millis())
                            .unwrap_or(u64::MAX),
                        "Primary not open yet, racing fallback"
                    );
                    fallback = Some(self.fallback.open(address));
                    fallback_started = true;
                }
                RaceStep::Deadline => {
                    close_slot(&mut primary);
                    close_slot(&mut fallback);
                    failures.push(format!(
                        "timed out after {}ms",
                        self.config.attempt_timeout.as_millis()
                    ));
                    return Attempt::Failed(failures.join("; "));
                }
                RaceStep::Command(None) => {
                    close_slot(&mut primary);
                    close_slot(&mut fallback);
                    return Attempt::Interrupted(Flow::Stop);
                }
                RaceStep::Command(Some(command)) => {
                    if let Some(flow) = self.interrupt(command) {
                        close_slot(&mut primary);
                        close_slot(&mut fallback);
                        return Attempt::Interrupted(flow);
                    }
                }
            }
        }
    }

    fn adopt(&mut self, channel: Channel) {
        tracing::info!(transport = %channel.kind(), channel = %channel.id(), "Transport adopted");
        self.transition(ConnectionState::Connected);
        let flushed = self
            .queue
            .flush(|envelope| channel.send(envelope.clone()).map_err(|_| envelope));
        if flushed > 0 {
            tracing::debug!(flushed, "Flushed queued envelopes");
        }
        self.active = Some(channel);
    }

    /// Connected: move frames in and envelopes out until the channel ends.
    async fn pump(&mut self) -> Flow {
        if self.active.is_none() {
            self.transition(ConnectionState::Reconnecting);
            return Flow::Continue;
        }
        let step = {
            let Some(channel) = self.active.as_mut() else {
                return Flow::Continue;
            };
            tokio::select! {
                event = channel.next_event() => PumpStep::Event(event),
                command = self.commands.recv() => PumpStep::Command(command),
            }
        };

        match step {
            PumpStep::Event(Some(ChannelEvent::Frame(envelope))) => {
                tracing::trace!(kind = %envelope.kind, "Inbound envelope");
                let _ = self.frames.send(envelope);
            }
            PumpStep::Event(Some(ChannelEvent::Opened)) => {}
            PumpStep::Event(ended) => {
                let transport = self
                    .active
                    .as_ref()
                    .map_or(TransportKind::Primary, Channel::kind);
                let error = end_error(transport, ended);
                tracing::warn!(%transport, %error, "Active transport lost");
                self.drop_active();
                self.transition(ConnectionState::Reconnecting);
            }
            PumpStep::Command(None) => return Flow::Stop,
            PumpStep::Command(Some(Command::Send(envelope))) => {
                let delivered = self
                    .active
                    .as_ref()
                    .is_some_and(|channel| channel.send(envelope.clone()).is_ok());
                if !delivered {
                    // The channel is ending; its terminal event is next.
                    self.enqueue(envelope);
                }
            }
            PumpStep::Command(Some(Command::Close(ack))) => {
                self.shut_down_session();
                let _ = ack.send(ConnectionState::Disconnected);
            }
            PumpStep::Command(Some(Command::Start(address, ack))) => {
                self.restart(address);
                let _ = ack.send(());
            }
            PumpStep::Command(Some(Command::Reconnect(ack))) => {
                let _ = ack.send(Ok(()));
            }
        }
        Flow::Continue
    }
}

async fn next_event(slot: &mut Option<Channel>) -> Option<ChannelEvent> {
    match slot {
        Some(channel) => channel.next_event().await,
        None => future::pending().await,
    }
}

fn close_slot(slot: &mut Option<Channel>) {
    if let Some(mut channel) = slot.take() {
        channel.close();
    }
}

/// The error a channel ended with. A clean close counts as a drop here.
fn end_error(kind: TransportKind, event: Option<ChannelEvent>) -> TransportError {
    match event {
        Some(ChannelEvent::Error(error)) => error,
        Some(ChannelEvent::Closed(reason)) => TransportError::Dropped { kind, reason },
        Some(other) => TransportError::Dropped {
            kind,
            reason: format!("unexpected {other:?}"),
        },
        None => TransportError::Dropped {
            kind,
            reason: "channel ended".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_error_keeps_transport_errors() {
        let refused = TransportError::OpenFailed {
            kind: TransportKind::Fallback,
            reason: "connection refused".to_string(),
        };
        assert_eq!(
            end_error(TransportKind::Fallback, Some(ChannelEvent::Error(refused.clone()))),
            refused
        );
    }

    #[test]
    fn test_clean_close_counts_as_drop() {
        assert_eq!(
            end_error(
                TransportKind::Primary,
                Some(ChannelEvent::Closed("closed by server".to_string()))
            ),
            TransportError::Dropped {
                kind: TransportKind::Primary,
                reason: "closed by server".to_string(),
            }
        );
        assert!(matches!(
            end_error(TransportKind::Primary, None),
            TransportError::Dropped { .. }
        ));
    }
}
