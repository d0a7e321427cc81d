use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::address::NodeAddress;
use crate::engine::{ConsensusEngine, EngineEvent};

/// Log every lifecycle event until the engine goes away.
pub fn observe(mut events: broadcast::Receiver<EngineEvent>, address: NodeAddress) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&address, &event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(node = %address, skipped, "Lifecycle observer fell behind")
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!(node = %address, "Lifecycle observer stopped");
    })
}

fn log_event(address: &NodeAddress, event: &EngineEvent) {
    match event {
        EngineEvent::HeartbeatTimeout => {
            info!(node = %address, "Heartbeat timeout, starting election")
        }
        EngineEvent::TermChange { to, from } => {
            info!(node = %address, from, to, "Term changed")
        }
        EngineEvent::LeaderChange { to, from } => info!(
            node = %address,
            from = %display_leader(from),
            to = %display_leader(to),
            "Leader changed"
        ),
        EngineEvent::StateChange { to, from } => {
            info!(node = %address, %from, %to, "State changed")
        }
        EngineEvent::Leader => info!(node = %address, "Became leader"),
        EngineEvent::Candidate => info!(node = %address, "Became candidate"),
    }
}

fn display_leader(leader: &Option<NodeAddress>) -> String {
    leader
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "none".to_string())
}

/// Join every configured peer other than ourselves, then seal the bootstrap set.
///
/// A failed join is logged and skipped; the engine retries contact on its own.
/// Returns the peers that were joined.
pub async fn bootstrap(engine: &dyn ConsensusEngine, peers: &[NodeAddress]) -> Vec<NodeAddress> {
    let own = engine.address();
    let mut joined = Vec::new();

    for peer in peers.iter().filter(|peer| *peer != own) {
        match engine.join(peer).await {
            Ok(()) => joined.push(peer.clone()),
            Err(e) => warn!(node = %own, peer = %peer, "Failed to join peer: {}", e),
        }
    }

    if let Err(e) = engine.start().await {
        warn!(node = %own, "Cluster bootstrap did not complete: {}", e);
    }

    info!(node = %own, peers = joined.len(), "Bootstrap finished");
    joined
}
