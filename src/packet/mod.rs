//! Inter-node packets.
//!
//! Everything on the consensus channel travels as a [`Packet`]. Data records and
//! engine control traffic share one channel but carry a tag, so only
//! [`Packet::Data`] is ever written into the store.

use openraft::error::{InstallSnapshotError, RaftError};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use serde::{Deserialize, Serialize};

use crate::config::{NodeId, TypeConfig};

/// An application key/value record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRecord {
    pub key: String,
    pub value: String,
}

impl DataRecord {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Engine RPCs carried over the packet channel.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "rpc", content = "request", rename_all = "snake_case")]
pub enum ControlMessage {
    AppendEntries(AppendEntriesRequest<TypeConfig>),
    Vote(VoteRequest<NodeId>),
    InstallSnapshot(InstallSnapshotRequest<TypeConfig>),
}

impl ControlMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::AppendEntries(_) => "append_entries",
            ControlMessage::Vote(_) => "vote",
            ControlMessage::InstallSnapshot(_) => "install_snapshot",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Packet {
    Data(DataRecord),
    Control(ControlMessage),
}

impl Packet {
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Data(_) => "data",
            Packet::Control(msg) => msg.name(),
        }
    }
}

impl From<DataRecord> for Packet {
    fn from(record: DataRecord) -> Self {
        Packet::Data(record)
    }
}

/// What the receiving node answered.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum PacketReply {
    /// The data record was written into the receiver's store.
    Applied,
    /// The store refused the record.
    Rejected { reason: String },
    /// A control packet arrived before the receiver's engine was attached.
    NotReady,
    AppendEntries(Result<AppendEntriesResponse<NodeId>, RaftError<NodeId>>),
    Vote(Result<VoteResponse<NodeId>, RaftError<NodeId>>),
    InstallSnapshot(
        Result<InstallSnapshotResponse<NodeId>, RaftError<NodeId, InstallSnapshotError>>,
    ),
}

impl PacketReply {
    pub fn kind(&self) -> &'static str {
        match self {
            PacketReply::Applied => "applied",
            PacketReply::Rejected { .. } => "rejected",
            PacketReply::NotReady => "not_ready",
            PacketReply::AppendEntries(_) => "append_entries",
            PacketReply::Vote(_) => "vote",
            PacketReply::InstallSnapshot(_) => "install_snapshot",
        }
    }
}
