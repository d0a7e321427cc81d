//! Raftlink - a replicated key-value node
//!
//! Each node runs an openraft engine for leader election, an HTTP packet transport
//! between nodes, a rocksdb store fed by a write-through bridge, and a client
//! gateway that accepts SET on the leader and GET anywhere.

pub mod address;
pub mod client;
pub mod config;
pub mod engine;
pub mod gateway;
pub mod node;
pub mod packet;
pub mod raft_log;
pub mod store;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use address::{AddressError, NodeAddress};
pub use client::GatewayClient;
pub use config::{ConfigError, Node, NodeId, RaftlinkConfig, TypeConfig};
pub use engine::{ConsensusEngine, EngineError, NodeRole, RaftEngine};
pub use gateway::{AckPolicy, CommandEnvelope, CommandReply, CommandRouter, GatewayError};
pub use node::RaftlinkNode;
pub use packet::{DataRecord, Packet, PacketReply};
pub use store::{KvStore, StoreError};
pub use transport::{HttpTransport, Transport, TransportError};

#[derive(thiserror::Error, Debug)]
pub enum RaftlinkError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Address error: {0}")]
    Address(#[from] AddressError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Command rejected ({:?}): {}", .0.kind, .0.reason)]
    Rejected(gateway::Rejection),

    #[error("No leader found")]
    NoLeader,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
