use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::TransportError;
use crate::address::NodeAddress;
use crate::config::NetworkConfig;
use crate::packet::{Packet, PacketReply};

/// Timeouts and eviction policy for outbound links
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Evict a link after this many consecutive failures; 0 never evicts
    pub max_consecutive_failures: u32,
}

impl Default for LinkSettings {
    fn default() -> Self {
        LinkSettings::from(&NetworkConfig::default())
    }
}

impl From<&NetworkConfig> for LinkSettings {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            request_timeout: config.request_timeout,
            connect_timeout: config.connect_timeout,
            max_consecutive_failures: config.max_consecutive_failures,
        }
    }
}

/// Outbound channel to exactly one peer
#[derive(Debug)]
pub struct PeerConnection {
    address: NodeAddress,
    url: String,
    client: Client,
    consecutive_failures: AtomicU32,
}

impl PeerConnection {
    fn connect(address: &NodeAddress, settings: &LinkSettings) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .connect_timeout(settings.connect_timeout)
            .build()
            .map_err(|e| TransportError::Client {
                address: address.clone(),
                message: e.to_string(),
            })?;

        Ok(Self {
            address: address.clone(),
            url: format!("{}/packet", address.http_base()),
            client,
            consecutive_failures: AtomicU32::new(0),
        })
    }

    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// POST one packet and decode the reply
    pub async fn send(&self, packet: &Packet) -> Result<PacketReply, TransportError> {
        debug!(peer = %self.address, kind = packet.kind(), "Sending packet");

        let response = self
            .client
            .post(&self.url)
            .json(packet)
            .send()
            .await
            .map_err(|e| TransportError::Unreachable {
                address: self.address.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                address: self.address.clone(),
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<PacketReply>()
            .await
            .map_err(|e| TransportError::Decode {
                address: self.address.clone(),
                message: e.to_string(),
            })
    }
}

/// Lazily created, cached outbound connections keyed by peer address
#[derive(Debug)]
pub struct PeerLinkPool {
    settings: LinkSettings,
    links: RwLock<HashMap<NodeAddress, Arc<PeerConnection>>>,
}

impl PeerLinkPool {
    pub fn new(settings: LinkSettings) -> Self {
        Self {
            settings,
            links: RwLock::new(HashMap::new()),
        }
    }

    /// Return the cached link for `address`, creating it on first use.
    pub async fn get_or_connect(
        &self,
        address: &NodeAddress,
    ) -> Result<Arc<PeerConnection>, TransportError> {
        if let Some(link) = self.links.read().await.get(address) {
            return Ok(link.clone());
        }

        let mut links = self.links.write().await;
        // Another writer may have won the race while we waited for the lock.
        if let Some(link) = links.get(address) {
            return Ok(link.clone());
        }

        let link = Arc::new(PeerConnection::connect(address, &self.settings)?);
        info!(peer = %address, "Opened peer link");
        links.insert(address.clone(), link.clone());
        Ok(link)
    }

    /// Send through the cached link, tracking failures for eviction.
    pub async fn send(
        &self,
        address: &NodeAddress,
        packet: &Packet,
    ) -> Result<PacketReply, TransportError> {
        let link = self.get_or_connect(address).await?;
        match link.send(packet).await {
            Ok(reply) => {
                link.consecutive_failures.store(0, Ordering::SeqCst);
                Ok(reply)
            }
            Err(e) => {
                error!(peer = %address, kind = packet.kind(), "Failed to write to peer: {}", e);
                self.record_failure(&link).await;
                Err(e)
            }
        }
    }

    async fn record_failure(&self, link: &Arc<PeerConnection>) {
        let failures = link.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        let limit = self.settings.max_consecutive_failures;
        if limit == 0 || failures < limit {
            return;
        }

        let mut links = self.links.write().await;
        // Only evict the link that failed; a fresh one may already be cached.
        if links
            .get(link.address())
            .is_some_and(|cached| Arc::ptr_eq(cached, link))
        {
            links.remove(link.address());
            warn!(
                peer = %link.address(),
                failures,
                "Evicted peer link after consecutive failures"
            );
        }
    }

    pub async fn contains(&self, address: &NodeAddress) -> bool {
        self.links.read().await.contains_key(address)
    }

    pub async fn len(&self) -> usize {
        self.links.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.links.read().await.is_empty()
    }
}
