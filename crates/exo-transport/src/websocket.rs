//! Fallback transport: raw WebSocket, one envelope per text frame.

use std::time::Duration;

use exo_core::{Address, Channel, ChannelIo, Transport, TransportKind};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Fallback transport settings.
#[derive(Debug, Clone)]
pub struct RawSocketConfig {
    /// Endpoint path.
    pub path: String,
    /// Bound on TCP/WebSocket connect.
    pub connect_timeout: Duration,
}

impl Default for RawSocketConfig {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Raw bidirectional socket with no framing beyond one envelope per message.
#[derive(Debug, Clone, Default)]
pub struct RawSocketTransport {
    config: RawSocketConfig,
}

impl RawSocketTransport {
    /// Create a fallback transport.
    #[must_use]
    pub const fn new(config: RawSocketConfig) -> Self {
        Self { config }
    }
}

impl Transport for RawSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Fallback
    }

    fn open(&self, address: &Address) -> Channel {
        let url = address.ws_url(TransportKind::Fallback, &self.config.path);
        let timeout = self.config.connect_timeout;
        Channel::spawn(TransportKind::Fallback, move |io| run(io, url, timeout))
    }
}

async fn run(mut io: ChannelIo, url: String, connect_timeout: Duration) {
    let ws = match tokio::time::timeout(connect_timeout, connect_async(url.as_str())).await {
        Ok(Ok((ws, _response))) => ws,
        Ok(Err(e)) => {
            io.error(format!("connect {url}: {e}"));
            return;
        }
        Err(_) => {
            io.timed_out(connect_timeout);
            return;
        }
    };
    let (mut sender, mut receiver) = ws.split();

    if !io.opened() {
        let _ = sender.close().await;
        return;
    }
    tracing::debug!(channel = %io.id(), %url, "Fallback channel open");

    loop {
        tokio::select! {
            outbound = io.next_outbound() => {
                let Some(envelope) = outbound else {
                    let _ = sender.close().await;
                    io.closed("closed by client");
                    return;
                };
                let json = match envelope.encode() {
                    Ok(j) => j,
                    Err(e) => {
                        tracing::error!("Failed to serialize message: {e}");
                        continue;
                    }
                };
                if let Err(e) = sender.send(Message::Text(json.into())).await {
                    io.error(format!("send failed: {e}"));
                    return;
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => io.frame_text(text.as_str()),
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(s) => io.frame_text(s),
                        Err(_) => tracing::warn!(channel = %io.id(), "Dropping non UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map_or_else(
                            || "closed by server".to_string(),
                            |f| format!("closed by server: {}", f.reason.as_str()),
                        );
                        io.closed(reason);
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        io.error(format!("socket error: {e}"));
                        return;
                    }
                    None => {
                        io.closed("connection closed by peer");
                        return;
                    }
                }
            }
        }
    }
}
