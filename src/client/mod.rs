use std::time::Duration;

use reqwest::Client;
use tracing::{debug, error};

use crate::address::NodeAddress;
use crate::engine::NodeRole;
use crate::gateway::{CommandEnvelope, CommandReply, NodeStatus, RejectionKind, SetAck};
use crate::RaftlinkError;

const DEFAULT_PORT_OFFSET: u16 = 100;

/// Client for the gateways of a raftlink cluster.
///
/// Gateways never redirect writes, so the client finds the leader itself.
pub struct GatewayClient {
    client: Client,
    gateways: Vec<NodeAddress>,
    port_offset: u16,
    current_leader: Option<NodeAddress>,
}

impl GatewayClient {
    /// Create a new client with a list of gateway addresses
    pub fn new(gateways: Vec<NodeAddress>) -> Result<Self, RaftlinkError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RaftlinkError::Network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            gateways,
            port_offset: DEFAULT_PORT_OFFSET,
            current_leader: None,
        })
    }

    /// Gateway port offset used to reach a leader learned from `/status`
    pub fn with_port_offset(mut self, port_offset: u16) -> Self {
        self.port_offset = port_offset;
        self
    }

    pub fn add_gateway(&mut self, gateway: NodeAddress) {
        if !self.gateways.contains(&gateway) {
            self.gateways.push(gateway);
        }
    }

    pub fn gateways(&self) -> &[NodeAddress] {
        &self.gateways
    }

    pub fn gateway_count(&self) -> usize {
        self.gateways.len()
    }

    /// Fetch `/status` from one gateway
    pub async fn status(&self, gateway: &NodeAddress) -> Result<NodeStatus, RaftlinkError> {
        let url = format!("{}/status", gateway.http_base());
        let response = self.client.get(&url).send().await.map_err(|e| {
            RaftlinkError::Network(format!("Failed to connect to {gateway}: {e}"))
        })?;

        if !response.status().is_success() {
            return Err(RaftlinkError::Network(format!(
                "Request to {} failed with status: {}",
                gateway,
                response.status()
            )));
        }

        response.json().await.map_err(|e| {
            RaftlinkError::Network(format!("Failed to parse status from {gateway}: {e}"))
        })
    }

    /// Send a raw command to one gateway
    pub async fn send(
        &self,
        gateway: &NodeAddress,
        envelope: &CommandEnvelope,
    ) -> Result<CommandReply, RaftlinkError> {
        let url = format!("{}/command", gateway.http_base());
        debug!("Sending {} to: {}", envelope.task, url);

        let response = self
            .client
            .post(&url)
            .json(envelope)
            .send()
            .await
            .map_err(|e| {
                error!("Network error sending to {}: {}", url, e);
                RaftlinkError::Network(format!("Failed to connect to {gateway}: {e}"))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("Request failed with status {}: {}", status, body);
            return Err(RaftlinkError::Network(format!(
                "Request failed with status {status}: {body}"
            )));
        }

        response.json().await.map_err(|e| {
            error!("Failed to parse response from {}: {}", url, e);
            RaftlinkError::Network(format!("Failed to parse response: {e}"))
        })
    }

    /// Find the gateway of the current leader, caching the answer
    pub async fn find_leader(&mut self) -> Result<NodeAddress, RaftlinkError> {
        if let Some(leader) = self.current_leader.clone() {
            if self.is_leader(&leader).await {
                return Ok(leader);
            }
            self.current_leader = None;
        }

        for gateway in self.gateways.clone() {
            let status = match self.status(&gateway).await {
                Ok(status) => status,
                Err(e) => {
                    debug!("Failed to get status from {}: {}", gateway, e);
                    continue;
                }
            };

            if status.role == NodeRole::Leader {
                self.current_leader = Some(gateway.clone());
                return Ok(gateway);
            }

            // This node knows who leads; try that node's gateway
            if let Some(leader) = status.leader {
                let Ok(leader_gateway) = leader.with_port_offset(self.port_offset) else {
                    continue;
                };
                if self.is_leader(&leader_gateway).await {
                    self.add_gateway(leader_gateway.clone());
                    self.current_leader = Some(leader_gateway.clone());
                    return Ok(leader_gateway);
                }
            }
        }

        Err(RaftlinkError::NoLeader)
    }

    async fn is_leader(&self, gateway: &NodeAddress) -> bool {
        matches!(self.status(gateway).await, Ok(status) if status.role == NodeRole::Leader)
    }

    /// Set a key-value pair through the leader
    pub async fn set(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<SetAck, RaftlinkError> {
        let leader = self.find_leader().await?;
        let reply = self.send(&leader, &CommandEnvelope::set(key, value)).await?;

        if matches!(&reply, CommandReply::Error(r) if r.kind == RejectionKind::NotLeader) {
            // Leadership moved since we looked
            self.current_leader = None;
        }
        expect_ack(reply)
    }

    /// Read a key from the first gateway that answers. Reads are local to each
    /// node and may be stale.
    pub async fn get(&self, key: impl Into<String>) -> Result<Option<String>, RaftlinkError> {
        let envelope = CommandEnvelope::get(key);
        let mut last_error = RaftlinkError::Network("No gateways configured".to_string());

        for gateway in &self.gateways {
            match self.send(gateway, &envelope).await {
                Ok(reply) => return expect_value(reply),
                Err(e) => {
                    debug!("Failed to read from {}: {}", gateway, e);
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    /// Read a key from one specific gateway
    pub async fn get_from(
        &self,
        gateway: &NodeAddress,
        key: impl Into<String>,
    ) -> Result<Option<String>, RaftlinkError> {
        let reply = self.send(gateway, &CommandEnvelope::get(key)).await?;
        expect_value(reply)
    }

    /// Wait until some gateway reports itself as leader
    pub async fn wait_for_leader(&mut self, timeout: Duration) -> Result<NodeAddress, RaftlinkError> {
        let start = std::time::Instant::now();

        while start.elapsed() < timeout {
            match self.find_leader().await {
                Ok(leader) => return Ok(leader),
                Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
            }
        }

        Err(RaftlinkError::NoLeader)
    }
}

fn expect_ack(reply: CommandReply) -> Result<SetAck, RaftlinkError> {
    match reply {
        CommandReply::Ack(ack) => Ok(ack),
        CommandReply::Error(rejection) => Err(RaftlinkError::Rejected(rejection)),
        CommandReply::Value(_) => Err(RaftlinkError::Network(
            "Gateway answered a SET with a value".to_string(),
        )),
    }
}

fn expect_value(reply: CommandReply) -> Result<Option<String>, RaftlinkError> {
    match reply {
        CommandReply::Value(value) => Ok(value),
        CommandReply::Error(rejection) => Err(RaftlinkError::Rejected(rejection)),
        CommandReply::Ack(_) => Err(RaftlinkError::Network(
            "Gateway answered a GET with an acknowledgment".to_string(),
        )),
    }
}
