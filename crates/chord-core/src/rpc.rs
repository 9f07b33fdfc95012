use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::peer::NodeAddr;
use crate::transport::{read_envelope, write_envelope};
use crate::wire::{
    Envelope, FileData, FindSuccessorRequest, GetFileRequest, GetNeighborsRequest,
    HealthCheckRequest, NotifyRequest, StoreFileRequest, WirePayload, FLAG_ERROR,
};

/// Per-call budget for connect + send + receive.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

pub trait AsyncIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> AsyncIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn AsyncIo>;

#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, peer: &NodeAddr) -> anyhow::Result<BoxedStream>;
}

/// Plain TCP dialing on the peer's advertised endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl PeerConnector for TcpConnector {
    async fn connect(&self, peer: &NodeAddr) -> anyhow::Result<BoxedStream> {
        let stream = TcpStream::connect((peer.ip.as_str(), peer.port)).await?;
        Ok(Box::new(stream) as BoxedStream)
    }
}

#[async_trait]
pub trait RequestTransport: Send + Sync {
    async fn request(
        &self,
        peer: &NodeAddr,
        request: Envelope,
        timeout_dur: Duration,
    ) -> anyhow::Result<Envelope>;
}

/// One connection per request, matching how peers dial each other: a call
/// is a dial, an envelope each way, and a hangup.
pub struct DirectRequestTransport<C> {
    connector: C,
}

impl<C> DirectRequestTransport<C> {
    pub fn new(connector: C) -> Self {
        Self { connector }
    }
}

#[async_trait]
impl<C: PeerConnector> RequestTransport for DirectRequestTransport<C> {
    async fn request(
        &self,
        peer: &NodeAddr,
        request: Envelope,
        timeout_dur: Duration,
    ) -> anyhow::Result<Envelope> {
        let exchange = async {
            let mut stream = self.connector.connect(peer).await?;
            write_envelope(&mut stream, &request).await?;
            let reply = read_envelope(&mut stream).await?;
            if reply.req_id != request.req_id {
                anyhow::bail!(
                    "reply correlates to request {} but {} was sent",
                    reply.req_id,
                    request.req_id
                );
            }
            Ok(reply)
        };
        match tokio::time::timeout(timeout_dur, exchange).await {
            Ok(result) => result,
            Err(_) => anyhow::bail!(
                "rpc to {} timed out after {:?}",
                peer.endpoint(),
                timeout_dur
            ),
        }
    }
}

/// Typed client for the six node methods.  Every failure (dial, timeout,
/// malformed reply, remote error envelope) collapses to `Err`/`false`
/// here; callers decide whether to try another peer.
#[derive(Clone)]
pub struct RpcClient {
    transport: Arc<dyn RequestTransport>,
    timeout: Duration,
    next_req_id: Arc<AtomicU32>,
}

impl RpcClient {
    pub fn new(transport: Arc<dyn RequestTransport>) -> Self {
        Self::with_timeout(transport, DEFAULT_RPC_TIMEOUT)
    }

    pub fn with_timeout(transport: Arc<dyn RequestTransport>, timeout: Duration) -> Self {
        Self {
            transport,
            timeout,
            next_req_id: Arc::new(AtomicU32::new(1)),
        }
    }

    async fn call(&self, peer: &NodeAddr, payload: &WirePayload) -> anyhow::Result<WirePayload> {
        let req_id = self.next_req_id.fetch_add(1, Ordering::Relaxed);
        let request = Envelope::from_typed(req_id, 0, payload)?;
        let reply = self.transport.request(peer, request, self.timeout).await?;
        if reply.flags & FLAG_ERROR != 0 {
            match reply.decode_typed()? {
                WirePayload::RpcFailure(failure) => {
                    anyhow::bail!("remote rejected call: {}", failure.message)
                }
                other => anyhow::bail!(
                    "error reply carries unexpected payload {:?}",
                    other.msg_type()
                ),
            }
        }
        reply.decode_typed()
    }

    /// Liveness probe; any reply other than an OK counts as dead.
    pub async fn health_check(&self, peer: &NodeAddr) -> bool {
        match self
            .call(peer, &WirePayload::HealthCheck(HealthCheckRequest {}))
            .await
        {
            Ok(WirePayload::HealthCheckOk(_)) => true,
            Ok(other) => {
                warn!(%peer, "health check got unexpected reply {:?}", other.msg_type());
                false
            }
            Err(err) => {
                debug!(%peer, "health check failed: {err:#}");
                false
            }
        }
    }

    /// Fetch the peer's successor list and predecessor in one call.
    pub async fn get_neighbors(
        &self,
        peer: &NodeAddr,
    ) -> anyhow::Result<(Vec<NodeAddr>, NodeAddr)> {
        match self
            .call(peer, &WirePayload::GetNeighbors(GetNeighborsRequest {}))
            .await?
        {
            WirePayload::Neighbors(neighbors) => {
                Ok((neighbors.successors, neighbors.predecessor))
            }
            other => anyhow::bail!("expected neighbors, got {:?}", other.msg_type()),
        }
    }

    /// Announce `candidate` as a potential predecessor of `peer`.  The
    /// outcome is the peer's business; only delivery is reported.
    pub async fn notify(&self, peer: &NodeAddr, candidate: &NodeAddr) -> bool {
        match self
            .call(
                peer,
                &WirePayload::Notify(NotifyRequest {
                    candidate: candidate.clone(),
                }),
            )
            .await
        {
            Ok(WirePayload::NotifyOk(_)) => true,
            Ok(other) => {
                warn!(%peer, "notify got unexpected reply {:?}", other.msg_type());
                false
            }
            Err(err) => {
                debug!(%peer, "notify failed: {err:#}");
                false
            }
        }
    }

    pub async fn find_successor(&self, peer: &NodeAddr, target: u64) -> anyhow::Result<NodeAddr> {
        match self
            .call(
                peer,
                &WirePayload::FindSuccessor(FindSuccessorRequest { target }),
            )
            .await?
        {
            WirePayload::SuccessorFound(found) => Ok(found.addr),
            other => anyhow::bail!("expected successor, got {:?}", other.msg_type()),
        }
    }

    pub async fn store_file(&self, peer: &NodeAddr, id: u64, name: &str, data: Vec<u8>) -> bool {
        match self
            .call(
                peer,
                &WirePayload::StoreFile(StoreFileRequest {
                    id,
                    name: name.to_string(),
                    data,
                }),
            )
            .await
        {
            Ok(WirePayload::StoreFileOk(_)) => true,
            Ok(other) => {
                warn!(%peer, "store_file got unexpected reply {:?}", other.msg_type());
                false
            }
            Err(err) => {
                debug!(%peer, file_id = id, "store_file failed: {err:#}");
                false
            }
        }
    }

    pub async fn get_file(&self, peer: &NodeAddr, id: u64) -> anyhow::Result<FileData> {
        match self
            .call(peer, &WirePayload::GetFile(GetFileRequest { id }))
            .await?
        {
            WirePayload::FileData(file) => Ok(file),
            other => anyhow::bail!("expected file data, got {:?}", other.msg_type()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_peer() -> NodeAddr {
        // Bind an ephemeral port, then free it so dials are refused.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);
        NodeAddr {
            ip: "127.0.0.1".into(),
            port,
            id: 1,
        }
    }

    fn client_with_timeout(timeout: Duration) -> RpcClient {
        RpcClient::with_timeout(
            Arc::new(DirectRequestTransport::new(TcpConnector)),
            timeout,
        )
    }

    #[tokio::test]
    async fn dial_failure_reports_dead_peer() {
        let client = client_with_timeout(Duration::from_secs(1));
        let peer = unreachable_peer();
        assert!(!client.health_check(&peer).await);
        assert!(client.get_neighbors(&peer).await.is_err());
        assert!(client.find_successor(&peer, 7).await.is_err());
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        // Accepts connections but never replies.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let peer = NodeAddr {
            ip: "127.0.0.1".into(),
            port,
            id: 1,
        };
        let client = client_with_timeout(Duration::from_millis(100));
        let started = std::time::Instant::now();
        assert!(!client.health_check(&peer).await);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
