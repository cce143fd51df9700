//! Transport adapter
//!
//! The DHT sends framed messages to addressed peers through the pluggable
//! [`Transport`] seam and answers inbound traffic through a registered
//! [`RequestHandler`]. Two implementations ship with the crate: an
//! in-process [`MemoryTransport`] used by the simulation test suites, and a
//! datagram [`UdpTransport`] with response correlation by payload id.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::errors::DhtError;
use crate::id::NodeId;
use crate::message::{MessageKind, WireMessage};
use crate::peer::PeerContact;

/// Default per-RPC deadline: 30 seconds.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Request/response transport to an addressed peer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a framed request and await the peer's response.
    async fn send(&self, peer: &PeerContact, msg: WireMessage) -> Result<WireMessage, DhtError>;

    /// Resolve an address into a live peer contact.
    async fn dial(&self, addr: &str) -> Result<PeerContact, DhtError>;

    /// Release transport resources. Further sends fail.
    async fn close(&self) -> Result<(), DhtError>;
}

/// Inbound side of a node: turn a request frame into an optional response.
/// Returning `None` drops the message silently.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, msg: WireMessage) -> Option<WireMessage>;
}

struct MemoryEndpoint {
    id: NodeId,
    handler: Arc<dyn RequestHandler>,
}

/// In-process message fabric connecting [`MemoryTransport`] endpoints.
///
/// Supports a uniform drop probability and endpoint detach, which the
/// convergence and churn suites use to model lossy networks and node death.
#[derive(Default)]
pub struct MemoryNetwork {
    endpoints: RwLock<HashMap<String, MemoryEndpoint>>,
    drop_rate: RwLock<f64>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register an endpoint and hand back its transport.
    pub async fn attach(
        self: &Arc<Self>,
        id: NodeId,
        address: &str,
        handler: Arc<dyn RequestHandler>,
    ) -> MemoryTransport {
        self.endpoints
            .write()
            .await
            .insert(address.to_string(), MemoryEndpoint { id, handler });
        MemoryTransport {
            network: Arc::clone(self),
            address: address.to_string(),
        }
    }

    /// Remove an endpoint; in-flight sends to it fail as unreachable.
    pub async fn detach(&self, address: &str) {
        self.endpoints.write().await.remove(address);
    }

    /// Uniform probability in [0, 1] that any RPC is dropped.
    pub async fn set_drop_rate(&self, rate: f64) {
        *self.drop_rate.write().await = rate.clamp(0.0, 1.0);
    }
}

/// Transport endpoint attached to a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    address: String,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, peer: &PeerContact, msg: WireMessage) -> Result<WireMessage, DhtError> {
        let drop_rate = *self.network.drop_rate.read().await;
        if drop_rate > 0.0 && rand::random::<f64>() < drop_rate {
            return Err(DhtError::Timeout(format!("rpc to {} dropped", peer.address)));
        }

        let handler = {
            let endpoints = self.network.endpoints.read().await;
            let endpoint = endpoints
                .get(&peer.address)
                .ok_or_else(|| DhtError::PeerUnreachable(peer.address.clone()))?;
            Arc::clone(&endpoint.handler)
        };

        match handler.handle(msg).await {
            Some(response) => Ok(response),
            None => Err(DhtError::Timeout(format!("no response from {}", peer.address))),
        }
    }

    async fn dial(&self, addr: &str) -> Result<PeerContact, DhtError> {
        let endpoints = self.network.endpoints.read().await;
        let endpoint = endpoints
            .get(addr)
            .ok_or_else(|| DhtError::PeerUnreachable(addr.to_string()))?;
        Ok(PeerContact {
            id: endpoint.id,
            address: addr.to_string(),
        })
    }

    async fn close(&self) -> Result<(), DhtError> {
        self.network.detach(&self.address).await;
        Ok(())
    }
}

/// Datagram transport: JSON frames over UDP with response correlation.
///
/// A background task owns the receive side: response frames are matched to
/// pending requests by payload id; request frames go to the registered
/// handler and its response is written back to the source address.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_id: NodeId,
    local_addr: SocketAddr,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<WireMessage>>>>,
    rpc_timeout: Duration,
    recv_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl UdpTransport {
    /// Bind a socket and start the receive loop.
    pub async fn bind(
        bind_addr: SocketAddr,
        local_id: NodeId,
        handler: Arc<dyn RequestHandler>,
        rpc_timeout: Duration,
    ) -> Result<Arc<Self>, DhtError> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| DhtError::Transport(format!("bind {}: {}", bind_addr, e)))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| DhtError::Transport(e.to_string()))?;

        let transport = Arc::new(Self {
            socket: Arc::new(socket),
            local_id,
            local_addr,
            pending: Arc::new(Mutex::new(HashMap::new())),
            rpc_timeout,
            recv_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let task = tokio::spawn(Self::recv_loop(
            Arc::clone(&transport.socket),
            Arc::clone(&transport.pending),
            handler,
        ));
        *transport.recv_task.lock().await = Some(task);

        Ok(transport)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn recv_loop(
        socket: Arc<UdpSocket>,
        pending: Arc<Mutex<HashMap<String, oneshot::Sender<WireMessage>>>>,
        handler: Arc<dyn RequestHandler>,
    ) {
        let mut buf = vec![0u8; 65536];
        loop {
            let (len, src) = match socket.recv_from(&mut buf).await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "udp receive failed");
                    continue;
                }
            };

            let msg = match WireMessage::decode(&buf[..len]) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(src = %src, error = %e, "dropping unparseable frame");
                    continue;
                }
            };

            if msg.kind == MessageKind::Response {
                if let Some(tx) = pending.lock().await.remove(&msg.payload.id) {
                    let _ = tx.send(msg);
                }
                continue;
            }

            if let Some(response) = handler.handle(msg).await {
                match response.encode() {
                    Ok(bytes) => {
                        if let Err(e) = socket.send_to(&bytes, src).await {
                            debug!(src = %src, error = %e, "failed to send response");
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to encode response"),
                }
            }
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, peer: &PeerContact, msg: WireMessage) -> Result<WireMessage, DhtError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DhtError::Transport("transport closed".to_string()));
        }

        let target: SocketAddr = peer
            .address
            .parse()
            .map_err(|_| DhtError::PeerUnreachable(format!("bad address {}", peer.address)))?;

        let message_id = msg.payload.id.clone();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(message_id.clone(), tx);

        let bytes = msg.encode()?;
        if let Err(e) = self.socket.send_to(&bytes, target).await {
            self.pending.lock().await.remove(&message_id);
            return Err(DhtError::PeerUnreachable(format!("{}: {}", target, e)));
        }

        match timeout(self.rpc_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.pending.lock().await.remove(&message_id);
                Err(DhtError::Transport("response channel closed".to_string()))
            }
            Err(_) => {
                self.pending.lock().await.remove(&message_id);
                Err(DhtError::Timeout(format!("rpc to {} timed out", target)))
            }
        }
    }

    async fn dial(&self, addr: &str) -> Result<PeerContact, DhtError> {
        // Identity is learned from the ping response.
        let probe = PeerContact {
            id: self.local_id,
            address: addr.to_string(),
        };
        let ping = WireMessage::ping(&self.local_id, &self.local_addr.to_string());
        let response = self.send(&probe, ping).await?;
        Ok(PeerContact {
            id: response.sender_id()?,
            address: addr.to_string(),
        })
    }

    async fn close(&self) -> Result<(), DhtError> {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(task) = self.recv_task.lock().await.take() {
            task.abort();
        }
        self.pending.lock().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DhtType;

    /// Handler that answers every query with a bare response frame.
    struct EchoHandler {
        id: NodeId,
    }

    #[async_trait]
    impl RequestHandler for EchoHandler {
        async fn handle(&self, msg: WireMessage) -> Option<WireMessage> {
            Some(WireMessage::response_to(&msg, &self.id))
        }
    }

    #[tokio::test]
    async fn test_memory_round_trip() {
        let net = MemoryNetwork::new();
        let server_id = NodeId::random();
        let client_id = NodeId::random();
        let _server = net
            .attach(server_id, "node-b", Arc::new(EchoHandler { id: server_id }))
            .await;
        let client = net
            .attach(client_id, "node-a", Arc::new(EchoHandler { id: client_id }))
            .await;

        let peer = client.dial("node-b").await.unwrap();
        assert_eq!(peer.id, server_id);

        let response = client
            .send(&peer, WireMessage::ping(&client_id, "node-a"))
            .await
            .unwrap();
        assert_eq!(response.sender_id().unwrap(), server_id);
        assert_eq!(response.dht_type, DhtType::Ping);
    }

    #[tokio::test]
    async fn test_memory_detached_peer_unreachable() {
        let net = MemoryNetwork::new();
        let server_id = NodeId::random();
        let client_id = NodeId::random();
        net.attach(server_id, "node-b", Arc::new(EchoHandler { id: server_id }))
            .await;
        let client = net
            .attach(client_id, "node-a", Arc::new(EchoHandler { id: client_id }))
            .await;

        net.detach("node-b").await;
        let peer = PeerContact {
            id: server_id,
            address: "node-b".to_string(),
        };
        let err = client
            .send(&peer, WireMessage::ping(&client_id, "node-a"))
            .await
            .unwrap_err();
        assert!(matches!(err, DhtError::PeerUnreachable(_)));
    }

    #[tokio::test]
    async fn test_memory_full_drop_rate_times_out() {
        let net = MemoryNetwork::new();
        let server_id = NodeId::random();
        let client_id = NodeId::random();
        net.attach(server_id, "node-b", Arc::new(EchoHandler { id: server_id }))
            .await;
        let client = net
            .attach(client_id, "node-a", Arc::new(EchoHandler { id: client_id }))
            .await;
        net.set_drop_rate(1.0).await;

        let peer = PeerContact {
            id: server_id,
            address: "node-b".to_string(),
        };
        let err = client
            .send(&peer, WireMessage::ping(&client_id, "node-a"))
            .await
            .unwrap_err();
        assert!(matches!(err, DhtError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_udp_round_trip() {
        let server_id = NodeId::random();
        let client_id = NodeId::random();
        let server = UdpTransport::bind(
            "127.0.0.1:0".parse().unwrap(),
            server_id,
            Arc::new(EchoHandler { id: server_id }),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        let client = UdpTransport::bind(
            "127.0.0.1:0".parse().unwrap(),
            client_id,
            Arc::new(EchoHandler { id: client_id }),
            Duration::from_secs(2),
        )
        .await
        .unwrap();

        let peer = client
            .dial(&server.local_addr().to_string())
            .await
            .unwrap();
        assert_eq!(peer.id, server_id);

        client.close().await.unwrap();
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_udp_send_after_close_fails() {
        let id = NodeId::random();
        let transport = UdpTransport::bind(
            "127.0.0.1:0".parse().unwrap(),
            id,
            Arc::new(EchoHandler { id }),
            Duration::from_millis(200),
        )
        .await
        .unwrap();
        transport.close().await.unwrap();

        let peer = PeerContact {
            id,
            address: "127.0.0.1:1".to_string(),
        };
        let err = transport
            .send(&peer, WireMessage::ping(&id, "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, DhtError::Transport(_)));
    }
}
