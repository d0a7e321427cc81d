//! openraft's outbound RPCs carried as control packets over a [`Transport`].

use std::sync::Arc;

use openraft::error::{
    InstallSnapshotError, NetworkError, RPCError, RaftError, RemoteError, Unreachable,
};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, VoteRequest, VoteResponse,
};

use super::{Transport, TransportError};
use crate::address::{AddressError, NodeAddress};
use crate::config::{Node, NodeId, TypeConfig};
use crate::packet::{ControlMessage, Packet, PacketReply};

type RpcResult<T, E = RaftError<NodeId>> = Result<T, RPCError<NodeId, Node, E>>;

#[derive(Clone)]
pub struct PacketNetworkFactory {
    transport: Arc<dyn Transport>,
}

impl PacketNetworkFactory {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

impl RaftNetworkFactory<TypeConfig> for PacketNetworkFactory {
    type Network = PacketNetwork;

    async fn new_client(&mut self, target: NodeId, node: &Node) -> Self::Network {
        PacketNetwork {
            target,
            address: node.address.parse(),
            transport: self.transport.clone(),
        }
    }
}

/// Connection handle openraft keeps per target node
pub struct PacketNetwork {
    target: NodeId,
    address: Result<NodeAddress, AddressError>,
    transport: Arc<dyn Transport>,
}

#[derive(Debug, thiserror::Error)]
#[error("Unexpected {reply} reply to {rpc}")]
struct UnexpectedReply {
    rpc: &'static str,
    reply: &'static str,
}

impl PacketNetwork {
    async fn call<E: std::error::Error>(
        &self,
        message: ControlMessage,
    ) -> RpcResult<PacketReply, E> {
        let address = self
            .address
            .as_ref()
            .map_err(|e| RPCError::Network(NetworkError::new(e)))?;

        match self.transport.write(address, Packet::Control(message)).await {
            Ok(PacketReply::NotReady) => Err(RPCError::Unreachable(Unreachable::new(
                &TransportError::NotInitialized,
            ))),
            Ok(reply) => Ok(reply),
            Err(e @ TransportError::Unreachable { .. }) => {
                Err(RPCError::Unreachable(Unreachable::new(&e)))
            }
            Err(e) => Err(RPCError::Network(NetworkError::new(&e))),
        }
    }

    fn unexpected<E: std::error::Error>(
        rpc: &'static str,
        reply: &PacketReply,
    ) -> RPCError<NodeId, Node, E> {
        RPCError::Network(NetworkError::new(&UnexpectedReply {
            rpc,
            reply: reply.kind(),
        }))
    }
}

impl RaftNetwork<TypeConfig> for PacketNetwork {
    async fn append_entries(
        &mut self,
        req: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> RpcResult<AppendEntriesResponse<NodeId>> {
        match self.call::<RaftError<NodeId>>(ControlMessage::AppendEntries(req)).await? {
            PacketReply::AppendEntries(Ok(resp)) => Ok(resp),
            PacketReply::AppendEntries(Err(e)) => {
                Err(RPCError::RemoteError(RemoteError::new(self.target, e)))
            }
            other => Err(Self::unexpected("append_entries", &other)),
        }
    }

    async fn install_snapshot(
        &mut self,
        req: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> RpcResult<InstallSnapshotResponse<NodeId>, RaftError<NodeId, InstallSnapshotError>> {
        let reply = self
            .call::<RaftError<NodeId, InstallSnapshotError>>(ControlMessage::InstallSnapshot(req))
            .await?;
        match reply {
            PacketReply::InstallSnapshot(Ok(resp)) => Ok(resp),
            PacketReply::InstallSnapshot(Err(e)) => {
                Err(RPCError::RemoteError(RemoteError::new(self.target, e)))
            }
            other => Err(Self::unexpected("install_snapshot", &other)),
        }
    }

    async fn vote(
        &mut self,
        req: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> RpcResult<VoteResponse<NodeId>> {
        match self.call::<RaftError<NodeId>>(ControlMessage::Vote(req)).await? {
            PacketReply::Vote(Ok(resp)) => Ok(resp),
            PacketReply::Vote(Err(e)) => {
                Err(RPCError::RemoteError(RemoteError::new(self.target, e)))
            }
            other => Err(Self::unexpected("vote", &other)),
        }
    }
}
