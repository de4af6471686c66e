//! The client against real backend endpoints on ephemeral ports.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use exo_client::{
    Address, Client, ClientConfig, ClientError, ConnectRequest, Connecting, DisplayState, Envelope,
};
use exo_core::{Transport, envelope::CHAT_MESSAGE};
use exo_discovery::{
    Candidate, ContainerRuntime, Discovery, DiscoveryConfig, MemoryStore, RuntimeError, TcpProber,
};
use exo_session::ManagerError;
use exo_transport::{
    FramedTransport, RawSocketTransport,
    server::{EnvelopeHandler, Peer, create_fallback_router, create_primary_router},
};
use tokio::net::TcpListener;

/// Replies to chat with the same text and reports it is speaking.
struct Backend;

#[async_trait]
impl EnvelopeHandler for Backend {
    async fn on_envelope(&self, peer: &Peer, envelope: Envelope) {
        if envelope.is(CHAT_MESSAGE) {
            peer.send(Envelope::dot_state("speaking"));
            let text = envelope.payload["text"].as_str().unwrap_or_default();
            peer.send(Envelope::chat(format!("{text} (via {})", peer.kind())));
        }
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

async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

struct OneContainer(Candidate);

#[async_trait]
impl ContainerRuntime for OneContainer {
    async fn list(&self) -> Result<Vec<Candidate>, RuntimeError> {
        Ok(vec![self.0.clone()])
    }

    async fn launch(&self) -> Result<Option<Candidate>, RuntimeError> {
        Ok(None)
    }
}

fn fast_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.transport.connect_timeout_ms = 1_000;
    config.transport.primary_grace_ms = 300;
    config.transport.attempt_timeout_ms = 2_000;
    config.reconnect.base_delay_ms = 20;
    config.reconnect.max_delay_ms = 40;
    config.reconnect.max_attempts = 2;
    config.discovery.skip_in_container = false;
    config
}

fn client(config: ClientConfig, runtime: OneContainer) -> Client {
    let primary: Arc<dyn Transport> = Arc::new(FramedTransport::new(config.framed_config()));
    let fallback: Arc<dyn Transport> =
        Arc::new(RawSocketTransport::new(config.raw_socket_config()));
    let discovery = Discovery::new(
        Arc::new(runtime),
        Arc::new(TcpProber::new(Duration::from_millis(500))),
        Arc::new(MemoryStore::new()),
        DiscoveryConfig::default(),
    );
    Client::from_parts(config, primary, fallback, discovery)
}

fn candidate(address: Address) -> Candidate {
    Candidate {
        id: "local".to_string(),
        display_name: "local backend".to_string(),
        address,
    }
}

#[tokio::test]
async fn test_discover_connect_and_chat() {
    let handler = Arc::new(Backend);
    let primary = serve(create_primary_router(
        Arc::clone(&handler),
        Duration::from_millis(200),
    ))
    .await;
    let fallback = serve(create_fallback_router(handler)).await;
    let address = Address::new("127.0.0.1", primary, fallback);

    let client = client(fast_config(), OneContainer(candidate(address.clone())));
    let replies = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&replies);
    client.router().register(CHAT_MESSAGE, move |e| {
        sink.lock().unwrap().push(e.payload["text"].as_str().unwrap_or_default().to_string());
    });

    assert_eq!(
        client.connect(ConnectRequest::Discover).await.unwrap(),
        Connecting::Started(address)
    );
    client.connected().await.unwrap();

    let mut display = client.display();
    client.send(Envelope::chat("hello")).unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        display.wait_for(|d| *d == DisplayState::Speaking),
    )
    .await
    .unwrap()
    .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while replies.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(*replies.lock().unwrap(), ["hello (via primary)"]);

    client.close().await.unwrap();
    tokio::time::timeout(
        Duration::from_secs(1),
        display.wait_for(|d| *d == DisplayState::Idle),
    )
    .await
    .unwrap()
    .unwrap();
}

#[tokio::test]
async fn test_falls_back_when_primary_is_down() {
    let fallback = serve(create_fallback_router(Arc::new(Backend))).await;
    let address = Address::new("127.0.0.1", closed_port().await, fallback);

    let client = client(fast_config(), OneContainer(candidate(address.clone())));
    let mut frames = client.frames();
    client
        .open(ConnectRequest::Address(address))
        .await
        .unwrap();

    tokio_test::assert_ok!(client.send(Envelope::chat("hi")));
    let reply = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let envelope = frames.recv().await.unwrap();
            if envelope.is(CHAT_MESSAGE) {
                return envelope;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(reply.payload["text"], "hi (via fallback)");
}

#[tokio::test]
async fn test_unreachable_backend_fails_after_budget() {
    let address = Address::new("127.0.0.1", closed_port().await, closed_port().await);
    let client = client(fast_config(), OneContainer(candidate(address.clone())));

    let err = tokio::time::timeout(
        Duration::from_secs(10),
        client.open(ConnectRequest::Address(address)),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert!(matches!(
        err,
        ClientError::Manager(ManagerError::RetryBudgetExhausted { attempts: 2 })
    ));
    let mut display = client.display();
    tokio::time::timeout(
        Duration::from_secs(1),
        display.wait_for(|d| *d == DisplayState::Error),
    )
    .await
    .unwrap()
    .unwrap();
}

#[tokio::test]
async fn test_discovery_with_nothing_reachable() {
    let address = Address::new("127.0.0.1", closed_port().await, closed_port().await);
    let client = client(fast_config(), OneContainer(candidate(address)));

    let err = client.connect(ConnectRequest::Discover).await.unwrap_err();
    assert!(matches!(err, ClientError::Discovery(_)));
    assert!(err.to_string().contains("local backend"));
}
