//! Test doubles shared by unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::broadcast;

use crate::address::NodeAddress;
use crate::engine::{
    BroadcastReport, ConsensusEngine, EngineError, EngineEvent, MessageTarget, NodeRole,
};
use crate::packet::DataRecord;
use crate::store::KvStore;

/// Engine with a settable role that records what the node asks of it
pub(crate) struct MockEngine {
    address: NodeAddress,
    role: Mutex<NodeRole>,
    peers: Vec<NodeAddress>,
    unreachable: HashSet<NodeAddress>,
    fail_joins: bool,
    pub messages: Mutex<Vec<(MessageTarget, DataRecord)>>,
    pub joined: Mutex<Vec<NodeAddress>>,
    pub started: AtomicBool,
    pub events: broadcast::Sender<EngineEvent>,
}

impl MockEngine {
    pub fn new(address: &str, role: NodeRole) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            address: address.parse().unwrap(),
            role: Mutex::new(role),
            peers: Vec::new(),
            unreachable: HashSet::new(),
            fail_joins: false,
            messages: Mutex::new(Vec::new()),
            joined: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            events,
        }
    }

    pub fn with_peers(mut self, peers: &[&str]) -> Self {
        self.peers = peers.iter().map(|p| p.parse().unwrap()).collect();
        self
    }

    pub fn with_unreachable(mut self, peer: &str) -> Self {
        self.unreachable.insert(peer.parse().unwrap());
        self
    }

    pub fn with_failing_joins(mut self) -> Self {
        self.fail_joins = true;
        self
    }

    pub fn set_role(&self, role: NodeRole) {
        *self.role.lock().unwrap() = role;
    }

    pub fn message_count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }
}

#[async_trait]
impl ConsensusEngine for MockEngine {
    fn address(&self) -> &NodeAddress {
        &self.address
    }

    fn state(&self) -> NodeRole {
        *self.role.lock().unwrap()
    }

    fn term(&self) -> u64 {
        3
    }

    fn leader(&self) -> Option<NodeAddress> {
        (self.state() == NodeRole::Leader).then(|| self.address.clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    async fn join(&self, address: &NodeAddress) -> Result<(), EngineError> {
        self.joined.lock().unwrap().push(address.clone());
        if self.fail_joins {
            return Err(EngineError::Membership {
                address: address.clone(),
                message: "refused".to_string(),
            });
        }
        Ok(())
    }

    async fn start(&self) -> Result<(), EngineError> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn message(
        &self,
        target: MessageTarget,
        record: DataRecord,
    ) -> Result<BroadcastReport, EngineError> {
        self.messages.lock().unwrap().push((target, record));

        let mut report = BroadcastReport::default();
        for peer in &self.peers {
            if self.unreachable.contains(peer) {
                report.failed.push((peer.clone(), "unreachable".to_string()));
            } else {
                report.delivered.push(peer.clone());
            }
        }
        Ok(report)
    }
}

/// Helper function to open a store in a fresh temp directory
pub(crate) fn create_test_store() -> (Arc<KvStore>, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let store = KvStore::open(temp_dir.path().join("db"), 1024 * 1024, 16)
        .expect("Failed to open store");
    (Arc::new(store), temp_dir)
}
