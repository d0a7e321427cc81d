use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use openraft::error::{InitializeError, RaftError};
use openraft::{ChangeMembers, Raft, RaftMetrics};
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::{
    lifecycle_events, BroadcastReport, ConsensusEngine, EngineError, EngineEvent, EngineView,
    MessageTarget, NodeRole,
};
use crate::address::NodeAddress;
use crate::config::{Node, NodeId, TypeConfig};
use crate::packet::{DataRecord, Packet, PacketReply};
use crate::raft_log::open_engine_storage;
use crate::transport::{PacketNetworkFactory, Transport};

const EVENT_CAPACITY: usize = 64;

/// [`ConsensusEngine`] backed by openraft, sending everything through a [`Transport`]
pub struct RaftEngine {
    address: NodeAddress,
    id: NodeId,
    raft: Raft<TypeConfig>,
    transport: Arc<dyn Transport>,
    /// Bootstrap membership, including this node
    members: RwLock<BTreeMap<NodeId, Node>>,
    events: broadcast::Sender<EngineEvent>,
    watcher: JoinHandle<()>,
}

impl RaftEngine {
    /// Open the engine log at `log_path`, start openraft and attach it to `transport`.
    pub async fn new(
        config: openraft::Config,
        transport: Arc<dyn Transport>,
        log_path: impl AsRef<Path>,
    ) -> Result<Self, EngineError> {
        let address = transport.address().clone();
        let id = address.node_id();

        let config = Arc::new(
            config
                .validate()
                .map_err(|e| EngineError::Config(e.to_string()))?,
        );
        let (log_store, state_machine) =
            open_engine_storage(log_path).map_err(|e| EngineError::Storage(e.to_string()))?;
        let network = PacketNetworkFactory::new(transport.clone());

        let raft = Raft::new(id, config, network, log_store, state_machine)
            .await
            .map_err(|e| EngineError::Fatal(e.to_string()))?;
        transport.attach_engine(raft.clone());

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let metrics = raft.metrics();
        let initial = view_of(&metrics.borrow());
        let watcher = tokio::spawn(watch_metrics(metrics, initial, events.clone()));

        let mut members = BTreeMap::new();
        members.insert(id, Node::from(&address));

        info!(address = %address, node_id = id, "Consensus engine started");

        Ok(Self {
            address,
            id,
            raft,
            transport,
            members: RwLock::new(members),
            events,
            watcher,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.id
    }

    pub fn metrics(&self) -> RaftMetrics<NodeId, Node> {
        self.raft.metrics().borrow().clone()
    }

    /// Stop the engine and its event watcher.
    pub async fn shutdown(&self) {
        self.watcher.abort();
        if let Err(e) = self.raft.shutdown().await {
            warn!(address = %self.address, "Engine did not shut down cleanly: {}", e);
        }
        info!(address = %self.address, "Consensus engine stopped");
    }

    fn in_membership(&self, id: NodeId) -> bool {
        let metrics = self.raft.metrics();
        let metrics = metrics.borrow();
        let found = metrics
            .membership_config
            .membership()
            .voter_ids()
            .any(|voter| voter == id);
        found
    }

    /// Every known member except this node, from both the bootstrap set and
    /// the engine's current membership.
    async fn peers(&self) -> Vec<NodeAddress> {
        let mut nodes = self.members.read().await.clone();
        {
            let metrics = self.raft.metrics();
            let metrics = metrics.borrow();
            for (id, node) in metrics.membership_config.membership().nodes() {
                nodes.insert(*id, node.clone());
            }
        }

        nodes
            .into_iter()
            .filter(|(id, _)| *id != self.id)
            .filter_map(|(_, node)| match node.address.parse() {
                Ok(address) => Some(address),
                Err(e) => {
                    warn!(member = %node.address, "Skipping member with invalid address: {}", e);
                    None
                }
            })
            .collect()
    }

    async fn resolve(&self, target: MessageTarget) -> Result<Vec<NodeAddress>, EngineError> {
        match target {
            MessageTarget::Address(address) => Ok(vec![address]),
            MessageTarget::Role(NodeRole::Child) | MessageTarget::Role(NodeRole::Follower) => {
                Ok(self.peers().await)
            }
            MessageTarget::Role(NodeRole::Leader) => self
                .leader()
                .map(|leader| vec![leader])
                .ok_or_else(|| EngineError::NoTarget("no leader is known".to_string())),
            MessageTarget::Role(NodeRole::Candidate) => Err(EngineError::NoTarget(
                "candidates cannot be addressed".to_string(),
            )),
        }
    }
}

fn view_of(metrics: &RaftMetrics<NodeId, Node>) -> EngineView {
    let leader = metrics.current_leader.and_then(|leader_id| {
        metrics
            .membership_config
            .membership()
            .nodes()
            .find(|(id, _)| **id == leader_id)
            .and_then(|(_, node)| node.address.parse().ok())
    });

    EngineView {
        role: NodeRole::from(metrics.state),
        term: metrics.current_term,
        leader,
    }
}

async fn watch_metrics(
    mut metrics: watch::Receiver<RaftMetrics<NodeId, Node>>,
    mut prev: EngineView,
    events: broadcast::Sender<EngineEvent>,
) {
    while metrics.changed().await.is_ok() {
        let next = view_of(&metrics.borrow());
        for event in lifecycle_events(&prev, &next) {
            // No subscribers is fine.
            let _ = events.send(event);
        }
        prev = next;
    }
    debug!("Engine metrics channel closed");
}

#[async_trait]
impl ConsensusEngine for RaftEngine {
    fn address(&self) -> &NodeAddress {
        &self.address
    }

    fn state(&self) -> NodeRole {
        NodeRole::from(self.raft.metrics().borrow().state)
    }

    fn term(&self) -> u64 {
        self.raft.metrics().borrow().current_term
    }

    fn leader(&self) -> Option<NodeAddress> {
        view_of(&self.raft.metrics().borrow()).leader
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    async fn join(&self, address: &NodeAddress) -> Result<(), EngineError> {
        let id = address.node_id();
        if id == self.id {
            return Ok(());
        }

        let node = Node::from(address);
        self.members.write().await.insert(id, node.clone());
        info!(peer = %address, node_id = id, "Joined peer");

        if self.state() != NodeRole::Leader || self.in_membership(id) {
            return Ok(());
        }

        // Already leading an initialized cluster: grow it.
        let membership_err = |e: &dyn std::fmt::Display| EngineError::Membership {
            address: address.clone(),
            message: e.to_string(),
        };
        self.raft
            .add_learner(id, node, false)
            .await
            .map_err(|e| membership_err(&e))?;
        self.raft
            .change_membership(ChangeMembers::AddVoterIds(BTreeSet::from([id])), false)
            .await
            .map_err(|e| membership_err(&e))?;
        info!(peer = %address, "Promoted peer to voter");
        Ok(())
    }

    async fn start(&self) -> Result<(), EngineError> {
        let members = self.members.read().await.clone();
        info!(members = members.len(), "Initializing cluster");

        match self.raft.initialize(members).await {
            Ok(()) => Ok(()),
            Err(RaftError::APIError(InitializeError::NotAllowed(e))) => {
                info!("Cluster already initialized: {}", e);
                Ok(())
            }
            Err(e) => Err(EngineError::Initialize(e.to_string())),
        }
    }

    async fn message(
        &self,
        target: MessageTarget,
        record: DataRecord,
    ) -> Result<BroadcastReport, EngineError> {
        let targets = self.resolve(target).await?;

        let mut sends = JoinSet::new();
        let mut pending = HashMap::new();
        for address in targets {
            let transport = self.transport.clone();
            let packet = Packet::Data(record.clone());
            let target = address.clone();
            let handle = sends.spawn(async move { transport.write(&target, packet).await });
            pending.insert(handle.id(), address);
        }

        let mut report = BroadcastReport::default();
        while let Some(joined) = sends.join_next_with_id().await {
            let (id, outcome) = match joined {
                Ok((id, outcome)) => (id, outcome),
                Err(e) => {
                    let Some(address) = pending.remove(&e.id()) else {
                        warn!("Broadcast task failed: {}", e);
                        continue;
                    };
                    warn!(peer = %address, "Broadcast task failed: {}", e);
                    report.failed.push((address, format!("send task failed: {e}")));
                    continue;
                }
            };
            let Some(address) = pending.remove(&id) else {
                continue;
            };
            match outcome {
                Ok(PacketReply::Applied) => report.delivered.push(address),
                Ok(PacketReply::Rejected { reason }) => report.failed.push((address, reason)),
                Ok(other) => report
                    .failed
                    .push((address, format!("unexpected {} reply", other.kind()))),
                Err(e) => report.failed.push((address, e.to_string())),
            }
        }

        debug!(
            key = %record.key,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "Broadcast finished"
        );
        Ok(report)
    }
}
