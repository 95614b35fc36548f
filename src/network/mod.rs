//! Network module - Handles TCP communication between work manager nodes
//!
//! Provides:
//! - Server accepting inbound calls, one session per connection
//! - Session handler decoding, dispatching and answering a single request
//! - Client issuing one outbound call per connection

mod client;
mod connection;
mod server;
mod session;

pub use client::*;
pub use connection::*;
pub use server::*;
pub use session::*;

use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::DEFAULT_MAX_FRAME_SIZE;

/// Configuration for network operations
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Interface to listen on
    pub bind_address: String,
    /// Port to listen on (0 picks a free port)
    pub port: u16,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Whole-call timeout in milliseconds (request write + response read)
    pub call_timeout_ms: u64,
    /// Maximum frame size
    pub max_message_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: crate::protocol::DEFAULT_PORT,
            connect_timeout_ms: 5000,
            call_timeout_ms: 30_000,
            max_message_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl NetworkConfig {
    /// Loopback-only config on an ephemeral port
    pub fn loopback() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            ..Default::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Resolve a `host:port` endpoint to a socket address
pub async fn resolve_endpoint(endpoint: &str) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let mut addrs = lookup_host(endpoint).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve endpoint: {}", endpoint),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_literal_endpoint() {
        let addr = resolve_endpoint("127.0.0.1:24900").await.unwrap();
        assert_eq!(addr.port(), 24900);
        assert!(addr.ip().is_loopback());
    }

    #[tokio::test]
    async fn test_resolve_rejects_missing_port() {
        assert!(resolve_endpoint("127.0.0.1").await.is_err());
    }
}
