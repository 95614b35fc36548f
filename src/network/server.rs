//! Work manager server
//!
//! Accepts inbound calls and runs one [`Session`] per connection.

use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};

use super::connection::Connection;
use super::session::Session;
use super::NetworkConfig;
use crate::transport::Transport;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Work manager server
pub struct Server {
    /// Bound listener, handed to the accept loop on start
    listener: Option<TcpListener>,
    /// Address the listener is bound to
    local_addr: SocketAddr,
    /// Server configuration
    config: NetworkConfig,
    /// Shutdown signal
    shutdown_tx: Option<mpsc::Sender<()>>,
    /// Whether the server is running
    running: Arc<RwLock<bool>>,
}

impl Server {
    /// Bind the listening socket without accepting yet.
    ///
    /// Binding first lets the caller learn the real port (when configured
    /// with port 0) before building the node's address.
    pub async fn bind(config: NetworkConfig) -> ServerResult<Self> {
        let bind_addr = format!("{}:{}", config.bind_address, config.port);
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener: Some(listener),
            local_addr,
            config,
            shutdown_tx: None,
            running: Arc::new(RwLock::new(false)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start accepting calls for `transport`
    pub async fn start(&mut self, transport: Transport) -> ServerResult<()> {
        let listener = self.listener.take().ok_or(ServerError::AlreadyRunning)?;
        tracing::info!("Server listening on {}", self.local_addr);

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        {
            let mut running = self.running.write().await;
            *running = true;
        }

        let running = self.running.clone();
        let max_frame_size = self.config.max_message_size;
        let read_timeout = self.config.call_timeout();

        // Spawn the accept loop
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                tracing::trace!("New connection from {}", addr);

                                let conn = Connection::new(stream, addr.to_string(), max_frame_size);
                                let session = Session::new(conn, transport.clone())
                                    .with_read_timeout(read_timeout);
                                tokio::spawn(session.run());
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Server shutdown requested");
                        break;
                    }
                }
            }

            let mut running = running.write().await;
            *running = false;
        });

        Ok(())
    }

    /// Stop accepting calls; sessions in flight run to completion
    pub async fn stop(&mut self) -> ServerResult<()> {
        let tx = self.shutdown_tx.take().ok_or(ServerError::NotRunning)?;
        let _ = tx.send(()).await;
        Ok(())
    }

    /// Check if the server is running
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Client;
    use crate::transport::tests::local_transport;
    use std::time::Duration;

    #[tokio::test]
    async fn test_server_lifecycle() {
        let mut server = Server::bind(NetworkConfig::loopback()).await.unwrap();
        assert!(!server.is_running().await);
        assert_ne!(server.local_addr().port(), 0);
        assert!(matches!(server.stop().await, Err(ServerError::NotRunning)));

        let (transport, _) = local_transport(1, 1);
        server.start(transport.clone()).await.unwrap();
        assert!(server.is_running().await);
        assert!(matches!(
            server.start(transport).await,
            Err(ServerError::AlreadyRunning)
        ));

        let client = Client::new(NetworkConfig::loopback());
        client.ping(&server.local_addr().to_string()).await.unwrap();

        server.stop().await.unwrap();
        for _ in 0..50 {
            if !server.is_running().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!server.is_running().await);
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let first = Server::bind(NetworkConfig::loopback()).await.unwrap();
        let taken = NetworkConfig {
            port: first.local_addr().port(),
            ..NetworkConfig::loopback()
        };
        assert!(matches!(
            Server::bind(taken).await,
            Err(ServerError::BindFailed(_))
        ));
    }
}
