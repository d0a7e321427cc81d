//! One cluster node: transport, consensus engine, store and client gateway wired
//! together from a [`RaftlinkConfig`].

use std::sync::Arc;

use actix_web::dev::ServerHandle;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::address::NodeAddress;
use crate::config::{create_raft_config, RaftlinkConfig};
use crate::engine::{ConsensusEngine, RaftEngine};
use crate::gateway::{self, CommandRouter};
use crate::store::KvStore;
use crate::transport::{
    HttpTransport, InboundStatus, LinkSettings, Transport, TransportOptions, WriteThroughBridge,
};
use crate::RaftlinkError;

pub mod lifecycle;

pub struct RaftlinkNode {
    address: NodeAddress,
    gateway_address: NodeAddress,
    transport: Arc<HttpTransport>,
    engine: Arc<RaftEngine>,
    store: Arc<KvStore>,
    bridge: Arc<WriteThroughBridge>,
    router: Arc<CommandRouter>,
    inbound: InboundStatus,
    gateway: ServerHandle,
    observer: JoinHandle<()>,
}

impl RaftlinkNode {
    /// Bring a node up: bind the inbound channel and store, start the engine,
    /// join the configured peers and open the client gateway.
    ///
    /// Must run on the actix system that will drive the node's servers.
    pub async fn start(config: RaftlinkConfig) -> Result<Self, RaftlinkError> {
        config.validate()?;
        let address = config.own_address()?;
        let gateway_address = config.gateway_address()?;
        let peers = config.peer_addresses()?;

        info!(
            address = %address,
            gateway = %gateway_address,
            cluster = %config.cluster.name,
            "Starting node"
        );

        let transport = Arc::new(HttpTransport::new(
            address.clone(),
            LinkSettings::from(&config.network),
        ));
        let attached = transport
            .initialize(TransportOptions {
                store_path: config.data_path(&address),
                max_size_bytes: config.storage.max_size_bytes,
                max_handles: config.storage.max_handles,
                workers: config.network.workers,
            })
            .await?;
        if let InboundStatus::Unbound { reason } = &attached.inbound {
            error!(address = %address, "Node is unreachable for peers: {}", reason);
        }

        let engine = Arc::new(
            RaftEngine::new(
                create_raft_config(&config.raft),
                transport.clone(),
                config.log_path(&address),
            )
            .await?,
        );
        let observer = lifecycle::observe(engine.subscribe(), address.clone());
        lifecycle::bootstrap(engine.as_ref(), &peers).await;

        let router = Arc::new(CommandRouter::new(
            engine.clone(),
            attached.store.clone(),
            config.gateway.ack_policy,
        ));
        let gateway =
            gateway::http::serve(&gateway_address, router.clone(), config.gateway.workers)?;

        Ok(Self {
            address,
            gateway_address,
            transport,
            engine,
            store: attached.store,
            bridge: attached.bridge,
            router,
            inbound: attached.inbound,
            gateway,
            observer,
        })
    }

    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    pub fn gateway_address(&self) -> &NodeAddress {
        &self.gateway_address
    }

    pub fn engine(&self) -> &Arc<RaftEngine> {
        &self.engine
    }

    pub fn store(&self) -> &Arc<KvStore> {
        &self.store
    }

    pub fn bridge(&self) -> &Arc<WriteThroughBridge> {
        &self.bridge
    }

    pub fn router(&self) -> &Arc<CommandRouter> {
        &self.router
    }

    pub fn inbound(&self) -> &InboundStatus {
        &self.inbound
    }

    /// Stop serving clients and peers, then stop the engine.
    pub async fn shutdown(self) {
        info!(address = %self.address, "Shutting down node");
        self.gateway.stop(true).await;
        self.transport.shutdown().await;
        self.engine.shutdown().await;
        self.observer.abort();
    }
}
