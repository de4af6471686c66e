//! Backend-side endpoints for both transports.
//!
//! Used by the demo backend and by integration tests to stand up a real
//! server speaking exactly what the client transports expect.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use exo_core::{Envelope, TransportKind};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::framed::PRIMARY_PATH;
use crate::protocol::{ClientFrame, ServerFrame};

/// One connected client, as seen by the backend.
#[derive(Debug, Clone)]
pub struct Peer {
    id: Uuid,
    kind: TransportKind,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl Peer {
    fn new(kind: TransportKind, tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            tx,
        }
    }

    /// Connection id.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Transport the client connected over.
    #[must_use]
    pub const fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Push an envelope to this client.
    ///
    /// Returns `false` if the client is gone.
    pub fn send(&self, envelope: Envelope) -> bool {
        self.tx.send(envelope).is_ok()
    }
}

/// Application logic behind the endpoints.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync + 'static {
    /// A client connected.
    async fn on_connect(&self, _peer: &Peer) {}

    /// An envelope arrived from `peer`.
    async fn on_envelope(&self, peer: &Peer, envelope: Envelope);

    /// A client went away.
    async fn on_disconnect(&self, _peer: &Peer) {}
}

/// WebSocket handler state.
pub struct WsState<H> {
    /// Application handler.
    pub handler: Arc<H>,
    /// Heartbeat announced to primary clients.
    pub heartbeat: Duration,
}

impl<H> Clone for WsState<H> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            heartbeat: self.heartbeat,
        }
    }
}

/// Primary endpoint upgrade handler.
pub async fn primary_handler<H: EnvelopeHandler>(
    ws: WebSocketUpgrade,
    State(state): State<WsState<H>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_primary(socket, state))
}

/// Fallback endpoint upgrade handler.
pub async fn fallback_handler<H: EnvelopeHandler>(
    ws: WebSocketUpgrade,
    State(state): State<WsState<H>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_fallback(socket, state))
}

async fn handle_primary<H: EnvelopeHandler>(socket: WebSocket, state: WsState<H>) {
    let (mut sender, mut receiver) = socket.split();

    // Frames to the client; the open handshake goes first.
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();
    let heartbeat_ms = u64::try_from(state.heartbeat.as_millis()).unwrap_or(u64::MAX);
    let _ = tx.send(ServerFrame::Open { heartbeat_ms });

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let json = match frame.encode() {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize frame: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // Envelopes pushed by the application become numbered events.
    let (peer_tx, mut peer_rx) = mpsc::unbounded_channel::<Envelope>();
    let peer = Peer::new(TransportKind::Primary, peer_tx);
    let events_tx = tx.clone();
    let event_task = tokio::spawn(async move {
        let mut id = 1u64;
        while let Some(envelope) = peer_rx.recv().await {
            if events_tx.send(ServerFrame::Event { id, envelope }).is_err() {
                break;
            }
            id += 1;
        }
    });

    state.handler.on_connect(&peer).await;

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!("WebSocket error: {e}");
                break;
            }
        };

        match ClientFrame::decode(text.as_str()) {
            Ok(ClientFrame::Event { id, envelope }) => {
                let _ = tx.send(ServerFrame::Ack { id });
                state.handler.on_envelope(&peer, envelope).await;
            }
            Ok(ClientFrame::Ack { .. }) => {}
            Ok(ClientFrame::Ping) => {
                let _ = tx.send(ServerFrame::Pong);
            }
            Ok(ClientFrame::Close { reason }) => {
                tracing::debug!(peer = %peer.id, %reason, "Client closed primary channel");
                break;
            }
            Err(e) => {
                tracing::warn!("Invalid client frame: {e}");
            }
        }
    }

    state.handler.on_disconnect(&peer).await;
    event_task.abort();
    send_task.abort();
}

async fn handle_fallback<H: EnvelopeHandler>(socket: WebSocket, state: WsState<H>) {
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
    let peer = Peer::new(TransportKind::Fallback, tx);

    let send_task = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let json = match envelope.encode() {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    state.handler.on_connect(&peer).await;

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text.as_str().to_owned(),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!("WebSocket error: {e}");
                break;
            }
        };

        match Envelope::decode(&text) {
            Ok(envelope) => state.handler.on_envelope(&peer, envelope).await,
            Err(e) => tracing::warn!("Invalid client message: {e}"),
        }
    }

    state.handler.on_disconnect(&peer).await;
    send_task.abort();
}

/// Router serving the primary endpoint.
#[must_use]
pub fn create_primary_router<H: EnvelopeHandler>(handler: Arc<H>, heartbeat: Duration) -> axum::Router {
    axum::Router::new()
        .route(PRIMARY_PATH, axum::routing::get(primary_handler::<H>))
        .with_state(WsState { handler, heartbeat })
}

/// Router serving the fallback endpoint.
#[must_use]
pub fn create_fallback_router<H: EnvelopeHandler>(handler: Arc<H>) -> axum::Router {
    axum::Router::new()
        .route("/", axum::routing::get(fallback_handler::<H>))
        .with_state(WsState {
            handler,
            heartbeat: Duration::ZERO,
        })
}
