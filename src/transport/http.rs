use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use actix_web::dev::ServerHandle;
use actix_web::{web, App, HttpResponse, HttpServer};
use async_trait::async_trait;
use openraft::Raft;
use tracing::{debug, error, info, warn};

use super::{
    Attached, InboundStatus, LinkSettings, PeerLinkPool, Transport, TransportError,
    TransportOptions, WriteThroughBridge,
};
use crate::address::NodeAddress;
use crate::config::TypeConfig;
use crate::packet::{ControlMessage, Packet, PacketReply};
use crate::store::KvStore;

// Snapshots travel inside control packets.
const MAX_PACKET_BYTES: usize = 16 * 1024 * 1024;

/// Shared state behind the inbound `/packet` endpoint
#[derive(Clone)]
pub struct InboundState {
    bridge: Arc<WriteThroughBridge>,
    engine: Arc<OnceLock<Raft<TypeConfig>>>,
}

impl InboundState {
    pub fn new(bridge: Arc<WriteThroughBridge>, engine: Arc<OnceLock<Raft<TypeConfig>>>) -> Self {
        Self { bridge, engine }
    }

    /// Route one inbound packet: data to the store, control to the engine.
    pub async fn dispatch(&self, packet: Packet) -> PacketReply {
        match packet {
            Packet::Data(record) => self.bridge.apply(record),
            Packet::Control(message) => {
                let Some(raft) = self.engine.get() else {
                    debug!(rpc = message.name(), "Engine not attached yet");
                    return PacketReply::NotReady;
                };
                match message {
                    ControlMessage::AppendEntries(req) => {
                        PacketReply::AppendEntries(raft.append_entries(req).await)
                    }
                    ControlMessage::Vote(req) => PacketReply::Vote(raft.vote(req).await),
                    ControlMessage::InstallSnapshot(req) => {
                        PacketReply::InstallSnapshot(raft.install_snapshot(req).await)
                    }
                }
            }
        }
    }
}

async fn receive_packet(
    packet: web::Json<Packet>,
    state: web::Data<InboundState>,
) -> actix_web::Result<HttpResponse> {
    let reply = state.dispatch(packet.into_inner()).await;
    Ok(HttpResponse::Ok().json(reply))
}

/// Routes served on a node's inbound address
pub fn configure_inbound(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().limit(MAX_PACKET_BYTES))
        .route("/packet", web::post().to(receive_packet));
}

/// HTTP implementation of [`Transport`]
pub struct HttpTransport {
    address: NodeAddress,
    pool: PeerLinkPool,
    initialized: AtomicBool,
    engine: Arc<OnceLock<Raft<TypeConfig>>>,
    server: Mutex<Option<ServerHandle>>,
}

impl HttpTransport {
    pub fn new(address: NodeAddress, settings: LinkSettings) -> Self {
        Self {
            address,
            pool: PeerLinkPool::new(settings),
            initialized: AtomicBool::new(false),
            engine: Arc::new(OnceLock::new()),
            server: Mutex::new(None),
        }
    }

    pub fn pool(&self) -> &PeerLinkPool {
        &self.pool
    }

    fn bind(&self, state: InboundState, workers: usize) -> InboundStatus {
        let data = web::Data::new(state);
        let server = HttpServer::new(move || {
            App::new()
                .app_data(data.clone())
                .configure(configure_inbound)
        })
        .workers(workers)
        .disable_signals()
        .bind(self.address.authority());

        match server {
            Ok(server) => {
                let server = server.run();
                if let Ok(mut slot) = self.server.lock() {
                    *slot = Some(server.handle());
                }
                actix_web::rt::spawn(server);
                info!(address = %self.address, "Inbound channel bound");
                InboundStatus::Bound
            }
            Err(e) => {
                error!(address = %self.address, "Failed to bind inbound channel: {}", e);
                InboundStatus::Unbound {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Stop the inbound server, if it is running.
    pub async fn shutdown(&self) {
        let handle = self.server.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            handle.stop(true).await;
            info!(address = %self.address, "Inbound channel closed");
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn address(&self) -> &NodeAddress {
        &self.address
    }

    async fn initialize(&self, options: TransportOptions) -> Result<Attached, TransportError> {
        if self
            .initialized
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(TransportError::AlreadyInitialized);
        }

        let store = match KvStore::open(
            &options.store_path,
            options.max_size_bytes,
            options.max_handles,
        ) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                // Allow a retry once the cause is fixed.
                self.initialized.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        let bridge = Arc::new(WriteThroughBridge::new(store.clone()));
        let inbound = self.bind(
            InboundState::new(bridge.clone(), self.engine.clone()),
            options.workers,
        );

        Ok(Attached {
            store,
            bridge,
            inbound,
        })
    }

    fn attach_engine(&self, raft: Raft<TypeConfig>) {
        if self.engine.set(raft).is_err() {
            warn!(address = %self.address, "Engine already attached to transport");
        }
    }

    async fn write(
        &self,
        target: &NodeAddress,
        packet: Packet,
    ) -> Result<PacketReply, TransportError> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(TransportError::NotInitialized);
        }
        self.pool.send(target, &packet).await
    }
}
