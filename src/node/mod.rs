//! Node - one running work manager
//!
//! Binds the server, builds this node's address from the advertised host and
//! the real listening port, wires the engine's completion events into the
//! transport, and periodically sweeps out peers that stopped answering.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::engine::{EngineConfig, LogRunner, SlotEngine, WorkRunner};
use crate::network::{Client, NetworkConfig, Server, ServerResult};
use crate::protocol::Address;
use crate::transport::{NodeResult, Selector, Transport};

/// Everything needed to start a node
#[derive(Clone)]
pub struct NodeSettings {
    /// Fixed node id; a random one is generated when unset
    pub node_id: Option<String>,
    /// Host other nodes use to reach this one
    pub advertise_host: String,
    pub network: NetworkConfig,
    pub engine: EngineConfig,
    pub selector: Selector,
    pub runner: Arc<dyn WorkRunner>,
    /// How often to ping peers and drop dead ones; never when unset
    pub sweep_interval: Option<Duration>,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            node_id: None,
            advertise_host: "127.0.0.1".to_string(),
            network: NetworkConfig::default(),
            engine: EngineConfig::default(),
            selector: Selector::default(),
            runner: Arc::new(LogRunner),
            sweep_interval: None,
        }
    }
}

/// A running node
pub struct Node {
    server: Server,
    transport: Transport,
    pump: Option<JoinHandle<()>>,
    sweeper: Option<JoinHandle<()>>,
}

impl Node {
    pub async fn start(settings: NodeSettings) -> ServerResult<Self> {
        let mut server = Server::bind(settings.network.clone()).await?;
        let endpoint = endpoint(&settings.advertise_host, server.local_addr().port());
        let address = match settings.node_id {
            Some(id) => Address::new(id, endpoint),
            None => Address::generate(endpoint),
        };

        let mut engine = SlotEngine::new(settings.engine, settings.runner);
        let events = engine.take_event_receiver();

        let transport = Transport::new(
            address,
            Arc::new(engine),
            Client::new(settings.network),
            settings.selector,
        );
        server.start(transport.clone()).await?;
        let pump = events.map(|events| transport.spawn_event_pump(events));
        let sweeper = settings
            .sweep_interval
            .filter(|interval| !interval.is_zero())
            .map(|interval| transport.spawn_sweeper(interval));

        tracing::info!(node = %transport.local_address(), "Node started");

        Ok(Self {
            server,
            transport,
            pump,
            sweeper,
        })
    }

    /// Join the cluster `seed` belongs to
    pub async fn join(&self, seed: &str) -> NodeResult<usize> {
        self.transport.join_cluster(seed).await
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn address(&self) -> &Address {
        self.transport.local_address()
    }

    /// Leave the cluster and stop serving
    pub async fn shutdown(mut self) {
        self.transport.leave_cluster().await;

        if let Err(e) = self.server.stop().await {
            tracing::debug!(error = %e, "Server already stopped");
        }
        // Let the accept loop observe the shutdown before returning
        tokio::time::sleep(Duration::from_millis(10)).await;

        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }

        tracing::info!(node = %self.transport.local_address(), "Node stopped");
    }
}

/// `host:port`, bracketing IPv6 literals
fn endpoint(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
