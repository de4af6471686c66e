//! Demo backend that echoes chat back over whichever transport the client
//! picked.
//!
//! Run with: cargo run -p echo-backend
//!
//! Then point the chat client at it: cargo run -p chat-cli -- --host 127.0.0.1

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use exo_core::{
    Envelope,
    envelope::{CHAT_MESSAGE, VOICE_MESSAGE},
};
use exo_transport::server::{EnvelopeHandler, Peer, create_fallback_router, create_primary_router};
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "echo-backend", about = "Serve the exo primary and fallback endpoints")]
struct Args {
    /// Address to bind both endpoints on.
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port of the framed primary endpoint.
    #[arg(long, env = "EXO_PORT", default_value_t = 8080)]
    port: u16,

    /// Port of the raw websocket fallback endpoint.
    #[arg(long, env = "EXO_WEBSOCKET_PORT", default_value_t = 8765)]
    websocket_port: u16,

    /// Heartbeat interval announced to primary clients, in milliseconds.
    #[arg(long, default_value_t = 10_000)]
    heartbeat_ms: u64,

    /// Pause between "processing" and the reply, in milliseconds.
    #[arg(long, default_value_t = 400)]
    think_ms: u64,

    /// Only serve the fallback endpoint, to exercise the client's fallback.
    #[arg(long)]
    no_primary: bool,
}

/// Echoes chat and voice back, announcing activity as it goes.
struct Echo {
    think: Duration,
}

#[async_trait]
impl EnvelopeHandler for Echo {
    async fn on_connect(&self, peer: &Peer) {
        tracing::info!(peer = %peer.id(), transport = %peer.kind(), "Client connected");
        peer.send(Envelope::dot_state("idle"));
    }

    async fn on_envelope(&self, peer: &Peer, envelope: Envelope) {
        let reply = if envelope.is(CHAT_MESSAGE) {
            let text = envelope.payload["text"].as_str().unwrap_or_default();
            format!("{text} (via {})", peer.kind())
        } else if envelope.is(VOICE_MESSAGE) {
            match envelope.decode_audio() {
                Some(audio) => format!("heard {} bytes of audio", audio.len()),
                None => {
                    tracing::warn!(peer = %peer.id(), "Voice message without audio");
                    return;
                }
            }
        } else {
            tracing::debug!(peer = %peer.id(), kind = %envelope.kind, "Ignoring envelope");
            return;
        };

        peer.send(Envelope::dot_state("processing"));
        tokio::time::sleep(self.think).await;
        peer.send(Envelope::dot_state("speaking"));
        peer.send(Envelope::chat(reply));
        peer.send(Envelope::message(json!({ "echoed": envelope.kind })));
        peer.send(Envelope::dot_state("idle"));
    }

    async fn on_disconnect(&self, peer: &Peer) {
        tracing::info!(peer = %peer.id(), transport = %peer.kind(), "Client disconnected");
    }
}

async fn serve(addr: SocketAddr, router: axum::Router, name: &'static str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {name} endpoint on {addr}"))?;
    tracing::info!("{name} endpoint listening on ws://{addr}");

    let app = router
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());
    axum::serve(listener, app)
        .await
        .with_context(|| format!("serving {name} endpoint"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let handler = Arc::new(Echo {
        think: Duration::from_millis(args.think_ms),
    });

    let fallback_addr: SocketAddr = format!("{}:{}", args.bind, args.websocket_port)
        .parse()
        .context("invalid fallback bind address")?;
    let fallback = serve(
        fallback_addr,
        create_fallback_router(Arc::clone(&handler)),
        "fallback",
    );

    if args.no_primary {
        return fallback.await;
    }

    let primary_addr: SocketAddr = format!("{}:{}", args.bind, args.port)
        .parse()
        .context("invalid primary bind address")?;
    let primary = serve(
        primary_addr,
        create_primary_router(handler, Duration::from_millis(args.heartbeat_ms)),
        "primary",
    );

    tokio::try_join!(primary, fallback)?;
    Ok(())
}
