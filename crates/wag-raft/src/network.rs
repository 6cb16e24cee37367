//! Peer transport.
//!
//! Cluster nodes exchange Raft RPCs (and forwarded client writes) over TCP
//! with u32 length-prefixed JSON frames. Addresses come from the static
//! peer list; there is no discovery. Connections are opened per request;
//! the traffic is control-plane volume, not data-path volume.

use std::io;
use std::time::Duration;

use openraft::error::InstallSnapshotError;
use openraft::error::NetworkError;
use openraft::error::RPCError;
use openraft::error::RaftError;
use openraft::error::Unreachable;
use openraft::network::RPCOption;
use openraft::network::RaftNetwork;
use openraft::network::RaftNetworkFactory;
use openraft::raft::AppendEntriesRequest;
use openraft::raft::AppendEntriesResponse;
use openraft::raft::InstallSnapshotRequest;
use openraft::raft::InstallSnapshotResponse;
use openraft::raft::VoteRequest;
use openraft::raft::VoteResponse;
use openraft::BasicNode;
use openraft::Raft;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::debug;
use tracing::info;
use tracing::warn;
use wag_store::Command;
use wag_store::CommandOutcome;

use crate::NodeId;
use crate::TypeConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// A single framed request between cluster nodes.
#[derive(Debug, Serialize, Deserialize)]
pub enum RpcRequest {
    AppendEntries(AppendEntriesRequest<TypeConfig>),
    InstallSnapshot(InstallSnapshotRequest<TypeConfig>),
    Vote(VoteRequest<NodeId>),
    /// A write forwarded from a follower to the leader.
    ClientWrite(Command),
}

#[derive(Debug, Serialize, Deserialize)]
pub enum RpcResponse {
    AppendEntries(Result<AppendEntriesResponse<NodeId>, String>),
    InstallSnapshot(Result<InstallSnapshotResponse<NodeId>, String>),
    Vote(Result<VoteResponse<NodeId>, String>),
    ClientWrite(Result<CommandOutcome, String>),
}

async fn write_frame<T: Serialize, W: AsyncWriteExt + Unpin>(writer: &mut W, value: &T) -> io::Result<()> {
    let body = serde_json::to_vec(value).map_err(io::Error::other)?;
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await
}

async fn read_frame<T: for<'de> Deserialize<'de>, R: AsyncReadExt + Unpin>(reader: &mut R) -> io::Result<T> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len).await?;
    let len = u32::from_be_bytes(len);
    if len > MAX_FRAME_BYTES {
        return Err(io::Error::other(format!("frame of {len} bytes exceeds limit")));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice(&body).map_err(io::Error::other)
}

/// Open a connection and run a single request/response exchange.
async fn exchange(addr: &str, request: &RpcRequest) -> io::Result<RpcResponse> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
    let mut stream = stream;
    stream.set_nodelay(true).ok();
    write_frame(&mut stream, request).await?;
    read_frame(&mut stream).await
}

/// Forward a client write to another node (normally the leader).
pub async fn forward_client_write(addr: &str, command: Command) -> io::Result<Result<CommandOutcome, String>> {
    match exchange(addr, &RpcRequest::ClientWrite(command)).await? {
        RpcResponse::ClientWrite(result) => Ok(result),
        other => Err(io::Error::other(format!("unexpected response: {other:?}"))),
    }
}

/// Creates per-target connections for openraft.
#[derive(Clone, Default)]
pub struct NetworkFactory;

impl RaftNetworkFactory<TypeConfig> for NetworkFactory {
    type Network = Connection;

    async fn new_client(&mut self, target: NodeId, node: &BasicNode) -> Self::Network {
        Connection {
            target,
            addr: node.addr.clone(),
        }
    }
}

/// Connection to one peer, dialled per request.
pub struct Connection {
    target: NodeId,
    addr: String,
}

impl Connection {
    async fn request(&self, request: RpcRequest) -> Result<RpcResponse, io::Error> {
        debug!(target = self.target, addr = %self.addr, "peer rpc");
        exchange(&self.addr, &request).await
    }
}

fn unreachable<E>(err: &io::Error) -> RPCError<NodeId, BasicNode, E>
where
    E: std::error::Error,
{
    RPCError::Unreachable(Unreachable::new(err))
}

fn remote_failure<E>(message: String) -> RPCError<NodeId, BasicNode, E>
where
    E: std::error::Error,
{
    RPCError::Network(NetworkError::new(&io::Error::other(message)))
}

impl RaftNetwork<TypeConfig> for Connection {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        match self.request(RpcRequest::AppendEntries(rpc)).await {
            Ok(RpcResponse::AppendEntries(Ok(response))) => Ok(response),
            Ok(RpcResponse::AppendEntries(Err(message))) => Err(remote_failure(message)),
            Ok(other) => Err(remote_failure(format!("unexpected response: {other:?}"))),
            Err(err) => Err(unreachable(&err)),
        }
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<InstallSnapshotResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId, InstallSnapshotError>>>
    {
        match self.request(RpcRequest::InstallSnapshot(rpc)).await {
            Ok(RpcResponse::InstallSnapshot(Ok(response))) => Ok(response),
            Ok(RpcResponse::InstallSnapshot(Err(message))) => Err(remote_failure(message)),
            Ok(other) => Err(remote_failure(format!("unexpected response: {other:?}"))),
            Err(err) => Err(unreachable(&err)),
        }
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        match self.request(RpcRequest::Vote(rpc)).await {
            Ok(RpcResponse::Vote(Ok(response))) => Ok(response),
            Ok(RpcResponse::Vote(Err(message))) => Err(remote_failure(message)),
            Ok(other) => Err(remote_failure(format!("unexpected response: {other:?}"))),
            Err(err) => Err(unreachable(&err)),
        }
    }
}

/// Accept loop serving Raft RPCs and forwarded writes from peers.
pub async fn serve_peer_rpc(
    listener: TcpListener,
    raft: Raft<TypeConfig>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(addr = ?listener.local_addr().ok(), "peer rpc listener started");
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, remote)) => {
                        let raft = raft.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_peer(stream, raft).await {
                                debug!(%remote, error = %err, "peer connection closed");
                            }
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "peer rpc accept failed");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("peer rpc listener shutting down");
                    return;
                }
            }
        }
    }
}

async fn handle_peer(mut stream: TcpStream, raft: Raft<TypeConfig>) -> io::Result<()> {
    loop {
        let request: RpcRequest = read_frame(&mut stream).await?;
        let response = match request {
            RpcRequest::AppendEntries(rpc) => {
                RpcResponse::AppendEntries(raft.append_entries(rpc).await.map_err(|err| err.to_string()))
            }
            RpcRequest::InstallSnapshot(rpc) => {
                RpcResponse::InstallSnapshot(raft.install_snapshot(rpc).await.map_err(|err| err.to_string()))
            }
            RpcRequest::Vote(rpc) => RpcResponse::Vote(raft.vote(rpc).await.map_err(|err| err.to_string())),
            RpcRequest::ClientWrite(command) => RpcResponse::ClientWrite(
                raft.client_write(command)
                    .await
                    .map(|response| response.data)
                    .map_err(|err| err.to_string()),
            ),
        };
        write_frame(&mut stream, &response).await?;
    }
}
