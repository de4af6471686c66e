//! Backend addressing.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Default port of the primary (framed) endpoint.
pub const DEFAULT_PRIMARY_PORT: u16 = 8080;
/// Default port of the fallback (raw socket) endpoint.
pub const DEFAULT_FALLBACK_PORT: u16 = 8765;

/// Which of the two transports a channel uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Framed channel with acknowledgements and heartbeat.
    Primary,
    /// Raw socket, one envelope per text frame.
    Fallback,
}

impl TransportKind {
    /// The port of `address` this transport connects to.
    #[must_use]
    pub const fn port(self, address: &Address) -> u16 {
        match self {
            Self::Primary => address.primary_port,
            Self::Fallback => address.fallback_port,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("primary"),
            Self::Fallback => f.write_str("fallback"),
        }
    }
}

/// Where a backend instance listens.
///
/// Immutable once resolved; re-discovery replaces it wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// Host name or IP.
    pub host: String,
    /// Port of the primary endpoint.
    pub primary_port: u16,
    /// Port of the fallback endpoint.
    pub fallback_port: u16,
}

impl Address {
    /// Create a new address.
    #[must_use]
    pub fn new(host: impl Into<String>, primary_port: u16, fallback_port: u16) -> Self {
        Self {
            host: host.into(),
            primary_port,
            fallback_port,
        }
    }

    /// `host:port` for the given transport.
    #[must_use]
    pub fn authority(&self, kind: TransportKind) -> String {
        let port = kind.port(self);
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{port}", self.host)
        } else {
            format!("{}:{port}", self.host)
        }
    }

    /// WebSocket URL for the given transport and path.
    #[must_use]
    pub fn ws_url(&self, kind: TransportKind, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("ws://{}/{path}", self.authority(kind))
    }

    /// Both ports, primary first.
    #[must_use]
    pub const fn ports(&self) -> [u16; 2] {
        [self.primary_port, self.fallback_port]
    }
}

impl Default for Address {
    fn default() -> Self {
        Self::new("localhost", DEFAULT_PRIMARY_PORT, DEFAULT_FALLBACK_PORT)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (primary {}, fallback {})",
            self.host, self.primary_port, self.fallback_port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_urls() {
        let addr = Address::new("127.0.0.1", 9000, 9001);
        assert_eq!(addr.ws_url(TransportKind::Primary, "/link"), "ws://127.0.0.1:9000/link");
        assert_eq!(addr.ws_url(TransportKind::Fallback, ""), "ws://127.0.0.1:9001/");
    }

    #[test]
    fn test_ipv6_authority() {
        let addr = Address::new("::1", 1, 2);
        assert_eq!(addr.authority(TransportKind::Fallback), "[::1]:2");
    }
}
