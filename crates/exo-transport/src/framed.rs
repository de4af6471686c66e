//! Primary transport: framed WebSocket channel with acks and heartbeat.
//!
//! Acks detect loss, they do not recover it: an event still unacknowledged
//! after `ack_timeout` fails the channel, and the envelope is not resent on
//! the next channel. Delivery is at most once.

use std::{collections::BTreeMap, time::Duration};

use exo_core::{Address, Channel, ChannelIo, Transport, TransportKind};
use futures::{SinkExt, StreamExt};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::protocol::{ClientFrame, ServerFrame};

/// Path of the primary endpoint on the backend.
pub const PRIMARY_PATH: &str = "/link";

/// Floor for the ping interval.
const MIN_PING_INTERVAL: Duration = Duration::from_millis(10);

/// Primary transport settings.
#[derive(Debug, Clone)]
pub struct FramedConfig {
    /// Endpoint path.
    pub path: String,
    /// Bound on TCP/WebSocket connect plus the `open` handshake.
    pub connect_timeout: Duration,
    /// Heartbeat interval used when the server does not announce one.
    pub heartbeat_interval: Duration,
    /// Silence after which the channel is considered dead. Pings go out at
    /// least twice per timeout, whatever interval the server announces.
    pub heartbeat_timeout: Duration,
    /// How long an outbound event may stay unacknowledged.
    pub ack_timeout: Duration,
}

impl Default for FramedConfig {
    fn default() -> Self {
        Self {
            path: PRIMARY_PATH.to_string(),
            connect_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(15),
        }
    }
}

/// Framed channel with built-in acknowledgement and heartbeat.
#[derive(Debug, Clone, Default)]
pub struct FramedTransport {
    config: FramedConfig,
}

impl FramedTransport {
    /// Create a primary transport.
    #[must_use]
    pub const fn new(config: FramedConfig) -> Self {
        Self { config }
    }
}

impl Transport for FramedTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Primary
    }

    fn open(&self, address: &Address) -> Channel {
        let url = address.ws_url(TransportKind::Primary, &self.config.path);
        let config = self.config.clone();
        Channel::spawn(TransportKind::Primary, move |io| run(io, url, config))
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn run(mut io: ChannelIo, url: String, config: FramedConfig) {
    let deadline = Instant::now() + config.connect_timeout;

    let ws = match tokio::time::timeout_at(deadline, connect_async(url.as_str())).await {
        Ok(Ok((ws, _response))) => ws,
        Ok(Err(e)) => {
            io.error(format!("connect {url}: {e}"));
            return;
        }
        Err(_) => {
            io.timed_out(config.connect_timeout);
            return;
        }
    };
    let (mut sink, mut stream) = ws.split();

    let heartbeat = match tokio::time::timeout_at(deadline, handshake(&mut stream)).await {
        Ok(Ok(Some(ms))) => Duration::from_millis(ms),
        Ok(Ok(None)) => config.heartbeat_interval,
        Ok(Err(reason)) => {
            io.error(format!("handshake with {url}: {reason}"));
            return;
        }
        Err(_) => {
            io.timed_out(config.connect_timeout);
            return;
        }
    };

    if !io.opened() {
        let _ = sink.close().await;
        return;
    }
    let ping_every = ping_interval(heartbeat, config.heartbeat_timeout);
    tracing::debug!(
        channel = %io.id(),
        %url,
        heartbeat_ms = heartbeat.as_millis(),
        ping_ms = ping_every.as_millis(),
        "Primary channel open"
    );

    let mut next_id: u64 = 1;
    let mut unacked: BTreeMap<u64, Instant> = BTreeMap::new();
    let mut last_seen = Instant::now();
    let mut ticker = tokio::time::interval_at(Instant::now() + ping_every, ping_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            outbound = io.next_outbound() => {
                let Some(envelope) = outbound else {
                    let bye = ClientFrame::Close { reason: "client closed".to_string() };
                    if let Ok(text) = bye.encode() {
                        let _ = sink.send(Message::Text(text.into())).await;
                    }
                    let _ = sink.close().await;
                    io.closed("closed by client");
                    return;
                };
                let id = next_id;
                next_id += 1;
                let frame = ClientFrame::Event { id, envelope };
                let text = match frame.encode() {
                    Ok(t) => t,
                    Err(e) => {
                        tracing::error!("Failed to serialize frame: {e}");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    io.error(format!("send failed: {e}"));
                    return;
                }
                unacked.insert(id, Instant::now());
            }
            msg = stream.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                        Ok(s) => s.into(),
                        Err(_) => {
                            tracing::warn!(channel = %io.id(), "Dropping non UTF-8 binary frame");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map_or_else(
                            || "closed by server".to_string(),
                            |f| format!("closed by server: {}", f.reason.as_str()),
                        );
                        io.closed(reason);
                        return;
                    }
                    Some(Ok(_)) => {
                        last_seen = Instant::now();
                        continue;
                    }
                    Some(Err(e)) => {
                        io.error(format!("socket error: {e}"));
                        return;
                    }
                    None => {
                        io.closed("connection closed by peer");
                        return;
                    }
                };
                last_seen = Instant::now();

                match ServerFrame::decode(text.as_str()) {
                    Ok(ServerFrame::Event { id, envelope }) => {
                        io.frame(envelope);
                        if let Ok(ack) = (ClientFrame::Ack { id }).encode() {
                            if let Err(e) = sink.send(Message::Text(ack.into())).await {
                                io.error(format!("send failed: {e}"));
                                return;
                            }
                        }
                    }
                    Ok(ServerFrame::Ack { id }) => {
                        unacked.remove(&id);
                    }
                    Ok(ServerFrame::Pong | ServerFrame::Open { .. }) => {}
                    Ok(ServerFrame::Close { reason }) => {
                        io.closed(format!("closed by server: {reason}"));
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(channel = %io.id(), "Dropping frame: {e}");
                    }
                }
            }
            _ = ticker.tick() => {
                if last_seen.elapsed() > config.heartbeat_timeout {
                    io.error("heartbeat timeout");
                    return;
                }
                if let Some((id, sent_at)) = unacked.first_key_value() {
                    if sent_at.elapsed() > config.ack_timeout {
                        io.error(format!("event {id} not acknowledged within {:?}", config.ack_timeout));
                        return;
                    }
                }
                let Ok(ping) = ClientFrame::Ping.encode() else { continue };
                if let Err(e) = sink.send(Message::Text(ping.into())).await {
                    io.error(format!("heartbeat failed: {e}"));
                    return;
                }
            }
        }
    }
}

/// How often to ping: the announced heartbeat, but never so rarely that a
/// healthy peer cannot answer within `timeout`.
fn ping_interval(announced: Duration, timeout: Duration) -> Duration {
    announced.min(timeout / 2).max(MIN_PING_INTERVAL)
}

/// Wait for the server's `open` frame.
///
/// Returns the announced heartbeat in milliseconds (`None` if zero).
async fn handshake(
    stream: &mut futures::stream::SplitStream<WsStream>,
) -> Result<Option<u64>, String> {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => match ServerFrame::decode(text.as_str()) {
                Ok(ServerFrame::Open { heartbeat_ms }) => {
                    return Ok((heartbeat_ms > 0).then_some(heartbeat_ms));
                }
                Ok(ServerFrame::Close { reason }) => return Err(format!("server refused: {reason}")),
                Ok(other) => {
                    tracing::debug!(?other, "Ignoring frame before handshake");
                }
                Err(e) => return Err(e.to_string()),
            },
            Ok(Message::Close(_)) => return Err("closed during handshake".to_string()),
            Ok(_) => {}
            Err(e) => return Err(e.to_string()),
        }
    }
    Err("connection closed during handshake".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_interval_follows_announcement() {
        assert_eq!(
            ping_interval(Duration::from_secs(10), Duration::from_secs(30)),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_ping_interval_fits_inside_timeout() {
        assert_eq!(
            ping_interval(Duration::from_secs(40), Duration::from_secs(30)),
            Duration::from_secs(15)
        );
        assert_eq!(
            ping_interval(Duration::from_secs(1), Duration::ZERO),
            MIN_PING_INTERVAL
        );
    }
}
