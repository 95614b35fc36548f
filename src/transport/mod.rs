//! Transport - node-local view of the cluster
//!
//! Holds the peer table and the capacity/outcome counters, serves the
//! `local_*` operations sessions dispatch to, and issues the outbound calls
//! that keep other nodes informed:
//! - membership: JOIN pulls a node's peer set and each peer's capacity
//!   directly from that peer; LEAVE drops a node
//! - capacity: every local submission or completion re-syncs this node's
//!   free counts and pushes them to the other nodes
//! - outcomes: the node that runs (or rejects) work counts it and pushes the
//!   increment to the other nodes
//! - liveness: `sweep` pings every peer and drops the ones that do not answer
//! - routing: `distribute` places work on the node with the most free slots

mod capacity;
mod routing;


pub use capacity::*;
pub use routing::*;

use dashmap::DashSet;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

use crate::engine::{EngineEvent, WorkEngine};
use crate::network::{CallError, Client};
use crate::protocol::{
    Address, Outcome, Pool, Request, Statistics, SubmitMode, Value, WorkFailure, WorkItem,
};

/// Errors raised while serving or issuing transport operations
#[derive(Error, Debug)]
pub enum NodeError {
    #[error(transparent)]
    Work(#[from] WorkFailure),

    #[error("Work manager {0} is not hosted on this node")]
    NotLocal(Address),

    #[error("Call to {endpoint} failed: {source}")]
    Call {
        endpoint: String,
        #[source]
        source: CallError,
    },
}

impl NodeError {
    /// Wrap a failed outbound call, keeping remote work failures distinguishable
    fn call(endpoint: &str, err: CallError) -> Self {
        match err {
            CallError::Work(failure) => NodeError::Work(failure),
            source => NodeError::Call {
                endpoint: endpoint.to_string(),
                source,
            },
        }
    }
}

pub type NodeResult<T> = Result<T, NodeError>;

/// Where `distribute` placed a work item
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub target: Address,
    /// Start delay in milliseconds, for [`SubmitMode::Start`]
    pub start_delay: Option<u64>,
}

/// Node-local transport state, cheap to clone and shared by all sessions
#[derive(Clone)]
pub struct Transport {
    /// This node
    local: Address,
    /// Known nodes, including this one
    peers: Arc<DashSet<Address>>,
    /// Free slots and outcome counters per node
    capacity: CapacityTable,
    /// Local work engine
    engine: Arc<dyn WorkEngine>,
    /// Outbound calls
    client: Client,
    /// Routing strategy for `distribute`
    selector: Selector,
    /// Serializes free-count broadcasts so peers see them in engine order
    broadcast_lock: Arc<Mutex<()>>,
}

impl Transport {
    pub fn new(
        local: Address,
        engine: Arc<dyn WorkEngine>,
        client: Client,
        selector: Selector,
    ) -> Self {
        let peers = Arc::new(DashSet::new());
        peers.insert(local.clone());

        let transport = Self {
            local,
            peers,
            capacity: CapacityTable::new(),
            engine,
            client,
            selector,
            broadcast_lock: Arc::new(Mutex::new(())),
        };
        transport.sync_local_capacity();
        transport
    }

    pub fn local_address(&self) -> &Address {
        &self.local
    }

    pub fn capacity(&self) -> &CapacityTable {
        &self.capacity
    }

    /// Known peer set, this node included
    pub fn peers(&self) -> HashSet<Address> {
        self.peers.iter().map(|p| p.key().clone()).collect()
    }

    /// Known peers other than this node
    pub fn remote_peers(&self) -> Vec<Address> {
        self.peers
            .iter()
            .map(|p| p.key().clone())
            .filter(|p| *p != self.local)
            .collect()
    }

    // ------------------------------------------------------------------
    // Serving side
    // ------------------------------------------------------------------

    /// JOIN: pull `joiner`'s peer set and register every peer
    pub async fn local_join(&self, joiner: &Address) -> NodeResult<usize> {
        let known = self
            .client
            .peers(&joiner.endpoint)
            .await
            .map_err(|e| NodeError::call(&joiner.endpoint, e))?;

        let added = self.absorb(known, Some(joiner)).await?;
        tracing::info!(joiner = %joiner, added, peers = self.peers.len(), "Node joined");
        Ok(added)
    }

    /// Query each peer's capacity from the peer itself, then register the
    /// ones that answered.
    ///
    /// Unreachable peers are skipped, except `required`: if that one cannot be
    /// queried nothing is recorded and the error is returned.
    async fn absorb(
        &self,
        known: HashSet<Address>,
        required: Option<&Address>,
    ) -> NodeResult<usize> {
        let mut pulled = Vec::with_capacity(known.len());
        for peer in known.into_iter().filter(|p| *p != self.local) {
            match self.pull_free(&peer).await {
                Ok((short_running, long_running)) => {
                    pulled.push((peer, short_running, long_running))
                }
                Err(e) if required == Some(&peer) => return Err(e),
                Err(e) => tracing::warn!(peer = %peer, error = %e, "Skipping unreachable peer"),
            }
        }

        let mut added = 0;
        for (peer, short_running, long_running) in pulled {
            self.capacity.set_free(&peer, Pool::ShortRunning, short_running);
            self.capacity.set_free(&peer, Pool::LongRunning, long_running);

            if self.peers.insert(peer.clone()) {
                tracing::info!(peer = %peer, short_running, long_running, "Registered peer");
                added += 1;
            }
        }

        Ok(added)
    }

    /// LEAVE: forget `address` and everything cached about it
    pub fn local_leave(&self, address: &Address) {
        let known = self.peers.remove(address).is_some();
        self.capacity.remove(address);

        if known {
            tracing::info!(peer = %address, peers = self.peers.len(), "Node left");
        }
    }

    pub fn local_ping(&self) {
        tracing::trace!(node = %self.local, "Ping");
    }

    /// Hand work addressed to this node to the local engine. The outcome is
    /// counted here, once, and pushed to every other node.
    pub async fn local_submit(
        &self,
        mode: SubmitMode,
        id: &Address,
        work: WorkItem,
    ) -> NodeResult<Option<u64>> {
        if *id != self.local {
            return Err(NodeError::NotLocal(id.clone()));
        }

        let result = match mode {
            SubmitMode::Do => self.engine.do_work(work).await.map(|()| None),
            SubmitMode::Start => self.engine.start_work(work).await.map(Some),
            SubmitMode::Schedule => self.engine.schedule_work(work).await.map(|()| None),
        };

        let outcome = match &result {
            Ok(_) => mode.accepted(),
            Err(failure) => {
                tracing::debug!(mode = ?mode, failure = %failure, "Work rejected");
                mode.rejected()
            }
        };
        self.capacity.record(&self.local, outcome);
        if self.peers.len() > 1 {
            let transport = self.clone();
            tokio::spawn(async move {
                transport.broadcast_delta(&transport.local, outcome).await;
            });
        }

        self.sync_local_capacity();
        Ok(result?)
    }

    pub fn local_free(&self, id: &Address, pool: Pool) -> u64 {
        self.capacity.free(id, pool)
    }

    pub fn local_update_free(&self, id: &Address, pool: Pool, free: u64) {
        self.capacity.set_free(id, pool, free);
    }

    pub fn local_statistics(&self, id: &Address) -> Statistics {
        self.capacity.statistics(id)
    }

    pub fn local_delta(&self, id: &Address, outcome: Outcome) -> u64 {
        self.capacity.record(id, outcome)
    }

    /// Copy the engine's free counts into this node's counters; when they
    /// changed, push them to the other nodes in the background
    pub fn sync_local_capacity(&self) -> bool {
        let changed = self.refresh_local_capacity();

        if changed && self.peers.len() > 1 {
            let transport = self.clone();
            tokio::spawn(async move {
                transport.broadcast_free().await;
            });
        }

        changed
    }

    /// Store the engine's current free counts; true if either changed
    fn refresh_local_capacity(&self) -> bool {
        let fresh = !self.capacity.contains(&self.local);
        let mut changed = fresh;
        for pool in [Pool::ShortRunning, Pool::LongRunning] {
            let free = self.engine.free(pool);
            if fresh || self.capacity.free(&self.local, pool) != free {
                changed = true;
            }
            self.capacity.set_free(&self.local, pool, free);
        }
        changed
    }

    // ------------------------------------------------------------------
    // Calling side
    // ------------------------------------------------------------------

    /// One outbound call to `address`; work failures stay `NodeError::Work`
    pub async fn send(&self, address: &Address, request: &Request) -> NodeResult<Option<Value>> {
        self.client
            .request(&address.endpoint, request)
            .await
            .map_err(|e| NodeError::call(&address.endpoint, e))
    }

    /// Join the cluster `seed` belongs to.
    ///
    /// Pulls the seed's peer set (and each peer's capacity, straight from the
    /// peer), then announces this node to every remote peer so each of them
    /// pulls it in turn. Returns the number of peers that accepted the
    /// announcement.
    pub async fn join_cluster(&self, seed: &str) -> NodeResult<usize> {
        let known = self
            .client
            .peers(seed)
            .await
            .map_err(|e| NodeError::call(seed, e))?;
        self.absorb(known, None).await?;

        let mut announced = 0;
        for peer in self.remote_peers() {
            match self.client.join(&peer.endpoint, &self.local).await {
                Ok(()) => announced += 1,
                Err(e) => tracing::warn!(peer = %peer, error = %e, "Failed to announce join"),
            }
        }

        tracing::info!(seed = %seed, peers = self.peers.len(), announced, "Joined cluster");
        Ok(announced)
    }

    /// Tell every remote peer this node is leaving, then forget them
    pub async fn leave_cluster(&self) {
        let request = Request::Leave {
            address: self.local.clone(),
        };
        let notified = self.broadcast(request).await;

        for peer in self.remote_peers() {
            self.local_leave(&peer);
        }

        tracing::info!(notified, "Left cluster");
    }

    /// Round-trip time to a node
    pub async fn ping(&self, address: &Address) -> NodeResult<Duration> {
        self.client
            .ping(&address.endpoint)
            .await
            .map_err(|e| NodeError::call(&address.endpoint, e))
    }

    /// Ping every remote peer and forget the ones that do not answer.
    /// Returns how many were dropped.
    pub async fn sweep(&self) -> usize {
        let mut pings = JoinSet::new();
        for peer in self.remote_peers() {
            let transport = self.clone();
            pings.spawn(async move {
                let result = transport.ping(&peer).await;
                (peer, result)
            });
        }

        let mut dropped = 0;
        while let Some(joined) = pings.join_next().await {
            match joined {
                Ok((peer, Ok(rtt))) => tracing::trace!(peer = %peer, ?rtt, "Peer alive"),
                Ok((peer, Err(e))) => {
                    tracing::info!(peer = %peer, error = %e, "Peer unreachable, removing");
                    self.local_leave(&peer);
                    dropped += 1;
                }
                Err(e) => tracing::warn!(error = %e, "Ping task failed"),
            }
        }

        if dropped > 0 {
            tracing::info!(dropped, remaining = self.peers.len(), "Swept dead peers");
        }
        dropped
    }

    /// Run `sweep` every `interval`
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let transport = self.clone();

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            timer.tick().await;

            loop {
                timer.tick().await;
                transport.sweep().await;
            }
        })
    }

    /// Ask a node for its own free count
    pub async fn fetch_free(&self, address: &Address, pool: Pool) -> NodeResult<u64> {
        self.client
            .free(&address.endpoint, address, pool)
            .await
            .map_err(|e| NodeError::call(&address.endpoint, e))
    }

    /// Both free counts of a node, straight from the node
    async fn pull_free(&self, address: &Address) -> NodeResult<(u64, u64)> {
        let short_running = self.fetch_free(address, Pool::ShortRunning).await?;
        let long_running = self.fetch_free(address, Pool::LongRunning).await?;
        Ok((short_running, long_running))
    }

    /// Ask a node for its own statistics
    pub async fn fetch_statistics(&self, address: &Address) -> NodeResult<Statistics> {
        self.client
            .statistics(&address.endpoint, address)
            .await
            .map_err(|e| NodeError::call(&address.endpoint, e))
    }

    /// Push this node's free counts to every remote peer.
    ///
    /// One broadcast at a time, each sending the engine's counts as of when
    /// it got its turn.
    pub async fn broadcast_free(&self) -> usize {
        let _turn = self.broadcast_lock.lock().await;
        self.refresh_local_capacity();

        let mut delivered = 0;
        for pool in [Pool::ShortRunning, Pool::LongRunning] {
            let request = Request::UpdateFree {
                pool,
                id: self.local.clone(),
                free: self.capacity.free(&self.local, pool),
            };
            delivered += self.broadcast(request).await;
        }
        delivered
    }

    /// Push an outcome increment for `id` to every remote peer
    pub async fn broadcast_delta(&self, id: &Address, outcome: Outcome) -> usize {
        self.broadcast(Request::Delta {
            outcome,
            id: id.clone(),
        })
        .await
    }

    /// Best-effort fan-out of one request; returns how many peers answered OK
    async fn broadcast(&self, request: Request) -> usize {
        let mut calls = JoinSet::new();
        for peer in self.remote_peers() {
            let transport = self.clone();
            let request = request.clone();
            calls.spawn(async move {
                let result = transport.send(&peer, &request).await;
                (peer, result)
            });
        }

        let mut delivered = 0;
        while let Some(joined) = calls.join_next().await {
            match joined {
                Ok((_, Ok(_))) => delivered += 1,
                Ok((peer, Err(e))) => {
                    tracing::warn!(peer = %peer, request = %request, error = %e, "Broadcast failed")
                }
                Err(e) => tracing::warn!(error = %e, "Broadcast task failed"),
            }
        }
        delivered
    }

    /// Place work on the best node.
    ///
    /// The node that takes the call counts the outcome and tells everyone
    /// else; here only the target's cached free count is lowered. A
    /// rejection is returned as `NodeError::Work` and never retried.
    pub async fn distribute(&self, work: WorkItem, mode: SubmitMode) -> NodeResult<Placement> {
        let pool = Pool::of(&work);
        let candidates: Vec<(Address, u64)> = self
            .peers()
            .into_iter()
            .map(|peer| {
                let free = self.capacity.free(&peer, pool);
                (peer, free)
            })
            .collect();
        let target = self.selector.select(&self.local, &candidates);

        tracing::debug!(work = %work, target = %target, mode = ?mode, "Distributing work");

        let result = if target == self.local {
            self.local_submit(mode, &target, work).await
        } else {
            self.client
                .submit(&target, mode, work)
                .await
                .map_err(|e| NodeError::call(&target.endpoint, e))
        };

        match &result {
            // The local engine already re-synced our own counts
            Ok(_) if target != self.local => {
                self.capacity.take_slot(&target, pool);
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(target = %target, error = %e, "Placement failed"),
        }

        result.map(|start_delay| Placement { target, start_delay })
    }

    /// Record finished local work and keep peers informed
    pub fn spawn_event_pump(&self, mut events: mpsc::Receiver<EngineEvent>) -> JoinHandle<()> {
        let transport = self.clone();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    EngineEvent::Finished {
                        work_id, succeeded, ..
                    } => {
                        let outcome = if succeeded {
                            Outcome::WorkSuccessful
                        } else {
                            Outcome::WorkFailed
                        };
                        tracing::debug!(work_id = %work_id, ?outcome, "Work finished");

                        transport.capacity.record(&transport.local, outcome);
                        transport.broadcast_delta(&transport.local, outcome).await;
                        transport.sync_local_capacity();
                    }
                }
            }
        })
    }
}
