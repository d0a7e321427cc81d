//! Consensus engine seam.
//!
//! The node only needs leader election and role tracking from its engine; data
//! replication is a broadcast of [`DataRecord`]s over the transport. [`RaftEngine`]
//! provides both on top of openraft.

use std::fmt;

use async_trait::async_trait;
use openraft::ServerState;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::address::NodeAddress;
use crate::packet::DataRecord;

pub mod raft;

pub use self::raft::RaftEngine;

/// Position of a node in the consensus protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
    /// A follower addressed individually by the leader. Only meaningful as a
    /// message target; a node never reports it as its own state.
    Child,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeRole::Follower => "FOLLOWER",
            NodeRole::Candidate => "CANDIDATE",
            NodeRole::Leader => "LEADER",
            NodeRole::Child => "CHILD",
        };
        f.write_str(name)
    }
}

impl From<ServerState> for NodeRole {
    fn from(state: ServerState) -> Self {
        match state {
            ServerState::Leader => NodeRole::Leader,
            ServerState::Candidate => NodeRole::Candidate,
            ServerState::Follower | ServerState::Learner | ServerState::Shutdown => {
                NodeRole::Follower
            }
        }
    }
}

/// Who a broadcast should reach
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageTarget {
    Role(NodeRole),
    Address(NodeAddress),
}

/// Lifecycle notifications, for observability only
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    HeartbeatTimeout,
    TermChange {
        to: u64,
        from: u64,
    },
    LeaderChange {
        to: Option<NodeAddress>,
        from: Option<NodeAddress>,
    },
    StateChange {
        to: NodeRole,
        from: NodeRole,
    },
    Leader,
    Candidate,
}

/// The part of the engine's state lifecycle events are derived from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineView {
    pub role: NodeRole,
    pub term: u64,
    pub leader: Option<NodeAddress>,
}

/// Events implied by moving from `prev` to `next`, in the order they are emitted.
pub fn lifecycle_events(prev: &EngineView, next: &EngineView) -> Vec<EngineEvent> {
    let mut events = Vec::new();

    if prev.role == NodeRole::Follower && next.role == NodeRole::Candidate {
        events.push(EngineEvent::HeartbeatTimeout);
    }

    if prev.term != next.term {
        events.push(EngineEvent::TermChange {
            to: next.term,
            from: prev.term,
        });
    }

    if prev.role != next.role {
        events.push(EngineEvent::StateChange {
            to: next.role,
            from: prev.role,
        });
        match next.role {
            NodeRole::Leader => events.push(EngineEvent::Leader),
            NodeRole::Candidate => events.push(EngineEvent::Candidate),
            _ => {}
        }
    }

    if prev.leader != next.leader {
        events.push(EngineEvent::LeaderChange {
            to: next.leader.clone(),
            from: prev.leader.clone(),
        });
    }

    events
}

/// Per-peer outcome of a `message` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: Vec<NodeAddress>,
    pub failed: Vec<(NodeAddress, String)>,
}

impl BroadcastReport {
    /// Peers the message was addressed to
    pub fn addressed(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }

    /// True when the sender plus every delivered peer form a strict majority of
    /// the sender plus every addressed peer.
    pub fn reaches_majority(&self) -> bool {
        let cluster = self.addressed() + 1;
        let acked = self.delivered.len() + 1;
        acked > cluster / 2
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Failed to open engine log: {0}")]
    Storage(String),

    #[error("Invalid engine configuration: {0}")]
    Config(String),

    #[error("Engine stopped: {0}")]
    Fatal(String),

    #[error("Failed to initialize cluster: {0}")]
    Initialize(String),

    #[error("Membership change for {address} failed: {message}")]
    Membership {
        address: NodeAddress,
        message: String,
    },

    #[error("No node to deliver to: {0}")]
    NoTarget(String),
}

#[async_trait]
pub trait ConsensusEngine: Send + Sync + 'static {
    /// This node's own address
    fn address(&self) -> &NodeAddress;

    /// Current local role. Never [`NodeRole::Child`].
    fn state(&self) -> NodeRole;

    fn term(&self) -> u64;

    /// Address of the leader this node currently knows of
    fn leader(&self) -> Option<NodeAddress>;

    /// Lifecycle notifications from now on
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;

    /// Make `address` part of the cluster.
    async fn join(&self, address: &NodeAddress) -> Result<(), EngineError>;

    /// Seal the bootstrap membership and begin electing a leader.
    async fn start(&self) -> Result<(), EngineError>;

    /// Deliver `record` to every node `target` resolves to.
    ///
    /// Per-peer failures are reported in the [`BroadcastReport`], not as an error.
    async fn message(
        &self,
        target: MessageTarget,
        record: DataRecord,
    ) -> Result<BroadcastReport, EngineError>;
}
