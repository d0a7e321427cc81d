//! Client gateway: SET/GET commands from external clients.
//!
//! Writes are accepted only on the leader, which applies them locally and then
//! broadcasts them to every other node. Reads are served from the local store
//! on any node and may be stale.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::address::NodeAddress;
use crate::engine::{ConsensusEngine, MessageTarget, NodeRole};
use crate::packet::DataRecord;
use crate::store::KvStore;

pub mod http;

/// Literal marker carried by every error reply
pub const ERROR_MARKER: &str = "error";

/// When a SET is acknowledged to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// As soon as the broadcast call returns, whatever it delivered
    #[default]
    OnBroadcast,
    /// Only if the leader plus the peers that applied it form a majority.
    ///
    /// A rejected write is not rolled back: the leader and every peer that applied
    /// it keep the value, so it reads as `unconfirmed` rather than failed.
    OnQuorum,
}

/// A client request. Every field is optional on the wire so that any JSON object
/// decodes and gets a marker reply; unknown or empty tasks are rejected by the router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    #[serde(default)]
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl CommandEnvelope {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            task: "SET".to_string(),
            key: Some(key.into()),
            value: Some(value.into()),
        }
    }

    pub fn get(key: impl Into<String>) -> Self {
        Self {
            task: "GET".to_string(),
            key: Some(key.into()),
            value: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    NotLeader,
    UnknownTask,
    /// The body was JSON but not a command object
    Malformed,
    MissingKey,
    MissingValue,
    Store,
    Engine,
    /// Stored on the leader but not confirmed by a majority
    Unconfirmed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub marker: String,
    pub kind: RejectionKind,
    pub reason: String,
}

impl Rejection {
    pub fn new(kind: RejectionKind, reason: impl Into<String>) -> Self {
        Self {
            marker: ERROR_MARKER.to_string(),
            kind,
            reason: reason.into(),
        }
    }
}

/// Acknowledgment of an accepted SET
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetAck {
    pub policy: AckPolicy,
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandReply {
    Value(Option<String>),
    Ack(SetAck),
    Error(Rejection),
}

impl CommandReply {
    fn reject(kind: RejectionKind, reason: impl Into<String>) -> Self {
        CommandReply::Error(Rejection::new(kind, reason))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, CommandReply::Error(_))
    }
}

/// What `GET /status` reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub address: NodeAddress,
    pub role: NodeRole,
    pub term: u64,
    pub leader: Option<NodeAddress>,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Failed to bind gateway at {address}: {source}")]
    Bind {
        address: NodeAddress,
        source: std::io::Error,
    },
}

/// Decodes client commands and applies the leader-only write policy
pub struct CommandRouter {
    engine: Arc<dyn ConsensusEngine>,
    store: Arc<KvStore>,
    ack_policy: AckPolicy,
}

impl CommandRouter {
    pub fn new(engine: Arc<dyn ConsensusEngine>, store: Arc<KvStore>, ack_policy: AckPolicy) -> Self {
        Self {
            engine,
            store,
            ack_policy,
        }
    }

    pub fn ack_policy(&self) -> AckPolicy {
        self.ack_policy
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            address: self.engine.address().clone(),
            role: self.engine.state(),
            term: self.engine.term(),
            leader: self.engine.leader(),
        }
    }

    /// Decode a raw request body and dispatch it. Bodies that are not a command
    /// object get a `malformed` rejection instead of a transport error.
    pub async fn dispatch_json(&self, body: serde_json::Value) -> CommandReply {
        match serde_json::from_value::<CommandEnvelope>(body) {
            Ok(envelope) => self.dispatch(envelope).await,
            Err(e) => {
                warn!("Malformed command: {}", e);
                CommandReply::reject(RejectionKind::Malformed, e.to_string())
            }
        }
    }

    pub async fn dispatch(&self, envelope: CommandEnvelope) -> CommandReply {
        debug!(task = %envelope.task, key = ?envelope.key, "Command received");

        match envelope.task.as_str() {
            "SET" => self.set(envelope.key, envelope.value).await,
            "GET" => match envelope.key {
                Some(key) => self.get(&key),
                None => CommandReply::reject(RejectionKind::MissingKey, "GET requires a key"),
            },
            other => {
                warn!(task = %other, "Unknown command");
                CommandReply::reject(
                    RejectionKind::UnknownTask,
                    format!("unknown task '{other}'"),
                )
            }
        }
    }

    async fn set(&self, key: Option<String>, value: Option<String>) -> CommandReply {
        let role = self.engine.state();
        if role != NodeRole::Leader {
            info!(key = ?key, role = %role, "Rejected write on non-leader");
            return CommandReply::reject(
                RejectionKind::NotLeader,
                format!("node is {role}, writes go to the leader"),
            );
        }

        let Some(key) = key else {
            return CommandReply::reject(RejectionKind::MissingKey, "SET requires a key");
        };
        let Some(value) = value else {
            return CommandReply::reject(RejectionKind::MissingValue, "SET requires a value");
        };

        if let Err(e) = self.store.set(&key, &value) {
            warn!(key = %key, "Local write failed: {}", e);
            return CommandReply::reject(RejectionKind::Store, e.to_string());
        }

        let report = match self
            .engine
            .message(MessageTarget::Role(NodeRole::Child), DataRecord::new(key.clone(), value))
            .await
        {
            Ok(report) => report,
            Err(e) => {
                warn!(key = %key, "Broadcast failed: {}", e);
                return CommandReply::reject(RejectionKind::Engine, e.to_string());
            }
        };

        for (peer, reason) in &report.failed {
            warn!(key = %key, peer = %peer, "Write not delivered: {}", reason);
        }

        if self.ack_policy == AckPolicy::OnQuorum && !report.reaches_majority() {
            return CommandReply::reject(
                RejectionKind::Unconfirmed,
                format!(
                    "stored but confirmed on only {} of {} nodes",
                    report.delivered.len() + 1,
                    report.addressed() + 1
                ),
            );
        }

        CommandReply::Ack(SetAck {
            policy: self.ack_policy,
            delivered: report.delivered.len(),
            failed: report.failed.len(),
        })
    }

    fn get(&self, key: &str) -> CommandReply {
        match self.store.get(key) {
            Ok(value) => CommandReply::Value(value),
            Err(e) => {
                warn!(key = %key, "Local read failed: {}", e);
                CommandReply::reject(RejectionKind::Store, e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod test;
