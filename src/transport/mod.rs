//! Packet transport between nodes.
//!
//! [`Transport`] is the environment contract the consensus engine depends on:
//! `initialize` binds the inbound channel and attaches the local store, `write`
//! delivers one packet to one peer. [`HttpTransport`] implements it with an
//! actix-web inbound server and a pool of cached reqwest clients.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use openraft::Raft;

use crate::address::NodeAddress;
use crate::config::TypeConfig;
use crate::packet::{Packet, PacketReply};
use crate::store::{KvStore, StoreError};

pub mod bridge;
pub mod http;
pub mod network;
pub mod pool;

pub use bridge::{DataReceived, WriteThroughBridge};
pub use http::{HttpTransport, InboundState};
pub use network::{PacketNetwork, PacketNetworkFactory};
pub use pool::{LinkSettings, PeerConnection, PeerLinkPool};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport is already initialized")]
    AlreadyInitialized,

    #[error("Transport is not initialized")]
    NotInitialized,

    #[error("Failed to open local store: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to build client for {address}: {message}")]
    Client { address: NodeAddress, message: String },

    #[error("Failed to reach {address}: {message}")]
    Unreachable { address: NodeAddress, message: String },

    #[error("Peer {address} answered with status {status}: {body}")]
    Status {
        address: NodeAddress,
        status: u16,
        body: String,
    },

    #[error("Malformed reply from {address}: {message}")]
    Decode { address: NodeAddress, message: String },
}

/// Everything `initialize` needs to bring the inbound side up.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Store location, derived from the node address
    pub store_path: PathBuf,
    pub max_size_bytes: u64,
    pub max_handles: u32,
    /// HTTP worker threads for the inbound server
    pub workers: usize,
}

/// State of the inbound channel after `initialize`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundStatus {
    Bound,
    /// Binding failed; the node keeps running but peers cannot reach it.
    Unbound { reason: String },
}

/// Result of a successful `initialize`.
#[derive(Debug, Clone)]
pub struct Attached {
    pub store: Arc<KvStore>,
    pub bridge: Arc<WriteThroughBridge>,
    pub inbound: InboundStatus,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// This node's own inbound address.
    fn address(&self) -> &NodeAddress;

    /// Bind the inbound channel, open the store and wire inbound handling.
    ///
    /// Must be called exactly once. A bind failure is logged and reported through
    /// [`InboundStatus::Unbound`] rather than as an error.
    async fn initialize(&self, options: TransportOptions) -> Result<Attached, TransportError>;

    /// Hand inbound control packets to the engine from now on.
    fn attach_engine(&self, raft: Raft<TypeConfig>);

    /// Deliver one packet to `target` and wait for its reply.
    ///
    /// Send failures are logged and returned; nothing is reported as delivered
    /// unless the peer answered.
    async fn write(&self, target: &NodeAddress, packet: Packet)
        -> Result<PacketReply, TransportError>;
}

#[cfg(test)]
mod test;
