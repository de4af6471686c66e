//! Both client transports against the real backend endpoints.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::extract::{
    WebSocketUpgrade,
    ws::{Message, WebSocket},
};
use exo_core::{Address, ChannelEvent, Envelope, Transport, TransportError, TransportKind};
use exo_transport::{
    ClientFrame, FramedConfig, FramedTransport, RawSocketConfig, RawSocketTransport, ServerFrame,
    framed::PRIMARY_PATH,
    server::{EnvelopeHandler, Peer, create_fallback_router, create_primary_router},
};
use tokio::net::TcpListener;

/// Echoes every envelope back, tagged with the transport it came in on.
struct Echo;

#[async_trait]
impl EnvelopeHandler for Echo {
    async fn on_envelope(&self, peer: &Peer, envelope: Envelope) {
        let reply = Envelope::new(
            envelope.kind.clone(),
            serde_json::json!({ "echo": envelope.payload, "via": peer.kind() }),
        );
        peer.send(reply);
    }
}

async fn serve(router: axum::Router) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    port
}

/// A port with nothing listening on it.
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Primary endpoint that completes the handshake and then never answers,
/// except for pongs when `answer_pings` is set. Events are never acked.
async fn unresponsive_primary(heartbeat_ms: u64, answer_pings: bool) -> u16 {
    let router = axum::Router::new().route(
        PRIMARY_PATH,
        axum::routing::get(move |ws: WebSocketUpgrade| async move {
            ws.on_upgrade(move |mut socket: WebSocket| async move {
                let open = ServerFrame::Open { heartbeat_ms }.encode().unwrap();
                if socket.send(Message::Text(open.into())).await.is_err() {
                    return;
                }
                while let Some(Ok(msg)) = socket.recv().await {
                    let Message::Text(text) = msg else { continue };
                    if answer_pings && matches!(ClientFrame::decode(text.as_str()), Ok(ClientFrame::Ping)) {
                        let pong = ServerFrame::Pong.encode().unwrap();
                        if socket.send(Message::Text(pong.into())).await.is_err() {
                            return;
                        }
                    }
                }
            })
        }),
    );
    serve(router).await
}

async fn next(channel: &mut exo_core::Channel) -> ChannelEvent {
    tokio::time::timeout(Duration::from_secs(5), channel.next_event())
        .await
        .expect("channel event in time")
        .expect("channel still alive")
}

#[tokio::test]
async fn test_primary_roundtrip_over_socket() {
    let handler = Arc::new(Echo);
    let primary = serve(create_primary_router(handler, Duration::from_millis(200))).await;
    let address = Address::new("127.0.0.1", primary, closed_port().await);

    let transport = FramedTransport::new(FramedConfig::default());
    let mut channel = transport.open(&address);
    assert_eq!(next(&mut channel).await, ChannelEvent::Opened);

    tokio_test::assert_ok!(channel.send(Envelope::chat("hello")));
    let ChannelEvent::Frame(reply) = next(&mut channel).await else {
        panic!("expected a frame");
    };
    assert_eq!(reply.kind, "chat_message");
    assert_eq!(reply.payload["echo"]["text"], "hello");
    assert_eq!(reply.payload["via"], "primary");

    // Heartbeats keep the channel alive well past several intervals.
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(channel.is_open());

    channel.close();
    assert!(channel.send(Envelope::chat("late")).is_err());
}

#[tokio::test]
async fn test_fallback_roundtrip_over_socket() {
    let handler = Arc::new(Echo);
    let fallback = serve(create_fallback_router(handler)).await;
    let address = Address::new("127.0.0.1", closed_port().await, fallback);

    let transport = RawSocketTransport::new(RawSocketConfig::default());
    assert_eq!(transport.kind(), TransportKind::Fallback);
    let mut channel = transport.open(&address);
    assert_eq!(next(&mut channel).await, ChannelEvent::Opened);

    let audio = b"RIFF....WAVE";
    channel.send(Envelope::voice(audio, 1.0)).unwrap();
    let ChannelEvent::Frame(reply) = next(&mut channel).await else {
        panic!("expected a frame");
    };
    assert_eq!(reply.payload["via"], "fallback");
    let echoed = Envelope::new("voice_message", reply.payload["echo"].clone());
    assert_eq!(echoed.decode_audio().unwrap(), audio);
}

#[tokio::test]
async fn test_refused_port_reports_error() {
    let address = Address::new("127.0.0.1", closed_port().await, closed_port().await);

    for transport in [
        Box::new(FramedTransport::default()) as Box<dyn Transport>,
        Box::new(RawSocketTransport::default()),
    ] {
        let mut channel = transport.open(&address);
        assert!(matches!(
            next(&mut channel).await,
            ChannelEvent::Error(TransportError::OpenFailed { .. })
        ));
        assert!(channel.next_event().await.is_none());
    }
}

#[tokio::test]
async fn test_plain_websocket_is_not_a_primary_endpoint() {
    // The fallback endpoint never sends the open handshake.
    let fallback = serve(create_fallback_router(Arc::new(Echo))).await;
    let address = Address::new("127.0.0.1", fallback, fallback);

    let transport = FramedTransport::new(FramedConfig {
        path: "/".to_string(),
        connect_timeout: Duration::from_millis(300),
        ..FramedConfig::default()
    });
    let mut channel = transport.open(&address);
    assert_eq!(
        next(&mut channel).await,
        ChannelEvent::Error(TransportError::Timeout {
            kind: TransportKind::Primary,
            after: Duration::from_millis(300),
        })
    );
}

#[tokio::test]
async fn test_slow_announced_heartbeat_keeps_channel_alive() {
    // The server announces a heartbeat longer than the client's timeout.
    let handler = Arc::new(Echo);
    let primary = serve(create_primary_router(handler, Duration::from_millis(400))).await;
    let address = Address::new("127.0.0.1", primary, closed_port().await);

    let transport = FramedTransport::new(FramedConfig {
        heartbeat_timeout: Duration::from_millis(300),
        ..FramedConfig::default()
    });
    let mut channel = transport.open(&address);
    assert_eq!(next(&mut channel).await, ChannelEvent::Opened);

    let quiet = tokio::time::timeout(Duration::from_millis(1500), channel.next_event()).await;
    assert!(quiet.is_err(), "healthy channel ended: {quiet:?}");
    assert!(channel.is_open());

    tokio_test::assert_ok!(channel.send(Envelope::chat("still here")));
    let ChannelEvent::Frame(reply) = next(&mut channel).await else {
        panic!("expected a frame");
    };
    assert_eq!(reply.payload["echo"]["text"], "still here");
}

#[tokio::test]
async fn test_silent_peer_fails_heartbeat() {
    let primary = unresponsive_primary(50, false).await;
    let address = Address::new("127.0.0.1", primary, closed_port().await);

    let transport = FramedTransport::new(FramedConfig {
        heartbeat_timeout: Duration::from_millis(200),
        ..FramedConfig::default()
    });
    let mut channel = transport.open(&address);
    assert_eq!(next(&mut channel).await, ChannelEvent::Opened);
    assert_eq!(
        next(&mut channel).await,
        ChannelEvent::Error(TransportError::Dropped {
            kind: TransportKind::Primary,
            reason: "heartbeat timeout".to_string(),
        })
    );
    assert!(!channel.is_open());
}

#[tokio::test]
async fn test_unacknowledged_event_fails_channel() {
    let primary = unresponsive_primary(50, true).await;
    let address = Address::new("127.0.0.1", primary, closed_port().await);

    let transport = FramedTransport::new(FramedConfig {
        heartbeat_timeout: Duration::from_secs(2),
        ack_timeout: Duration::from_millis(200),
        ..FramedConfig::default()
    });
    let mut channel = transport.open(&address);
    assert_eq!(next(&mut channel).await, ChannelEvent::Opened);

    // Pongs alone keep the channel up.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(channel.is_open());

    tokio_test::assert_ok!(channel.send(Envelope::chat("lost")));
    let ChannelEvent::Error(TransportError::Dropped { kind, reason }) = next(&mut channel).await
    else {
        panic!("expected the channel to drop");
    };
    assert_eq!(kind, TransportKind::Primary);
    assert!(reason.contains("not acknowledged"), "{reason}");
}
