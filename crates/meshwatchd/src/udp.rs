//! UDP datagram transport — one JSON frame per datagram.
//!
//! A session is a Hello/Welcome exchange: the dialler sends Hello with its
//! identity, the listener answers Welcome with its own and both sides
//! consider the session up. Discovery payloads ride in Data frames,
//! hex-encoded, attributed to whichever session owns the source address.
//! Bye tears a session down.
//!
//! Sends are queued and written by the receive loop, so the synchronous
//! transport calls never hit a socket that is not yet writable.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};

use meshwatch_core::wire::{method_of, Direction};
use meshwatch_core::{EndpointAddress, NodeId};
use meshwatch_discovery::{EndpointHandle, SessionEventAdapter, Transport};

/// Largest UDP payload over IPv4.
const MAX_DATAGRAM: usize = 65_507;

/// Peer-list rows that fit one datagram once the list is hex-encoded into a
/// Data frame, with room for long identities and IPv6 addresses.
pub const MAX_PEERS_PER_DATAGRAM: usize = 128;

type Outgoing = (SocketAddr, Vec<u8>);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
enum Frame {
    Hello { identity: NodeId },
    Welcome { identity: NodeId },
    Data { payload: String },
    Bye { identity: NodeId },
}

struct Bound {
    token: u64,
    identity: NodeId,
    subscriber: Option<SessionEventAdapter>,
    handlers: HashMap<&'static str, SessionEventAdapter>,
}

pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    next_token: AtomicU64,
    bound: RwLock<Option<Bound>>,
    /// Live sessions by peer identity.
    sessions: DashMap<NodeId, SocketAddr>,
    /// Reverse index for attributing inbound frames.
    by_addr: DashMap<SocketAddr, NodeId>,
    outbound: mpsc::UnboundedSender<Outgoing>,
    /// Taken by `run`.
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Outgoing>>>,
}

impl UdpTransport {
    pub async fn bind(listen: &str) -> Result<Self> {
        let socket = UdpSocket::bind(listen)
            .await
            .with_context(|| format!("failed to bind {listen}"))?;
        let local_addr = socket.local_addr()?;
        tracing::info!(addr = %local_addr, "udp transport bound");
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        Ok(Self {
            socket,
            local_addr,
            next_token: AtomicU64::new(1),
            bound: RwLock::new(None),
            sessions: DashMap::new(),
            by_addr: DashMap::new(),
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Receive loop and send queue. Runs until shutdown fires; frames queued
    /// before then are still written.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let taken = self.outbound_rx.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(mut outbound) = taken else {
            bail!("udp transport is already running");
        };
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    let mut flushed = 0usize;
                    while let Ok((to, bytes)) = outbound.try_recv() {
                        self.send_datagram(to, &bytes).await;
                        flushed += 1;
                    }
                    tracing::info!(flushed, "udp transport shutting down");
                    return Ok(());
                }

                Some((to, bytes)) = outbound.recv() => {
                    self.send_datagram(to, &bytes).await;
                }

                result = self.socket.recv_from(&mut buf) => {
                    let (len, from) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "recv_from failed");
                            continue;
                        }
                    };
                    self.handle_datagram(&buf[..len], from);
                }
            }
        }
    }

    fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        let frame: Frame = match serde_json::from_slice(data) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(%from, error = %e, "discarding undecodable datagram");
                return;
            }
        };
        let Some(local) = self.local_identity() else {
            tracing::trace!(%from, "no endpoint bound, dropping frame");
            return;
        };

        match frame {
            Frame::Hello { identity } => {
                if identity == local {
                    return;
                }
                if let Err(e) = self.transmit(from, &Frame::Welcome { identity: local }) {
                    tracing::warn!(%from, error = %e, "failed to answer hello");
                    return;
                }
                self.open_session(identity, from, Direction::Inbound);
            }

            Frame::Welcome { identity } => {
                if identity != local {
                    self.open_session(identity, from, Direction::Outbound);
                }
            }

            Frame::Data { payload } => {
                let Some(peer) = self.by_addr.get(&from).map(|e| e.value().clone()) else {
                    tracing::debug!(%from, "data from address without a session");
                    return;
                };
                let payload = match hex::decode(&payload) {
                    Ok(p) => Bytes::from(p),
                    Err(e) => {
                        tracing::warn!(peer = %peer, error = %e, "bad payload encoding");
                        return;
                    }
                };
                self.dispatch(peer, payload);
            }

            Frame::Bye { identity } => {
                let owner = self.by_addr.get(&from).map(|e| e.value().clone());
                if owner.as_ref() == Some(&identity) {
                    self.close_session(&identity);
                }
            }
        }
    }

    fn dispatch(&self, peer: NodeId, payload: Bytes) {
        let Some(method) = method_of(&payload) else {
            tracing::debug!(peer = %peer, "payload without a method");
            return;
        };
        let bound = self.bound();
        match bound.as_ref().and_then(|b| b.handlers.get(method.as_str())) {
            Some(handler) => {
                handler.on_message(peer, payload);
            }
            None => tracing::debug!(peer = %peer, method = %method, "no handler registered"),
        }
    }

    fn open_session(&self, identity: NodeId, addr: SocketAddr, direction: Direction) {
        if let Some(previous) = self.sessions.insert(identity.clone(), addr) {
            if previous == addr {
                tracing::trace!(peer = %identity, "session already up");
                return;
            }
            // Peer came back on a new address.
            self.by_addr.remove(&previous);
        }
        self.by_addr.insert(addr, identity.clone());
        tracing::debug!(peer = %identity, %addr, ?direction, "udp session up");

        self.notify(|s| {
            s.on_session_established(identity.clone(), direction);
            s.on_new_endpoint(identity.clone(), EndpointAddress::new(addr.to_string()));
        });
    }

    fn close_session(&self, identity: &NodeId) {
        if let Some((_, addr)) = self.sessions.remove(identity) {
            self.by_addr.remove(&addr);
            tracing::debug!(peer = %identity, %addr, "udp session closed");
            self.notify(|s| {
                s.on_session_closed(identity.clone());
            });
        }
    }

    async fn send_datagram(&self, to: SocketAddr, bytes: &[u8]) {
        if let Err(e) = self.socket.send_to(bytes, to).await {
            tracing::warn!(%to, error = %e, "send_to failed");
        }
    }

    /// Encode and queue a frame for the run loop.
    fn transmit(&self, to: SocketAddr, frame: &Frame) -> Result<()> {
        let bytes = serde_json::to_vec(frame)?;
        if bytes.len() > MAX_DATAGRAM {
            bail!("frame of {} bytes exceeds datagram limit", bytes.len());
        }
        self.outbound
            .send((to, bytes))
            .map_err(|_| anyhow!("udp transport stopped, dropping frame to {to}"))
    }

    fn notify(&self, f: impl FnOnce(&SessionEventAdapter)) {
        if let Some(adapter) = self.bound().as_ref().and_then(|b| b.subscriber.as_ref()) {
            f(adapter);
        }
    }

    fn local_identity(&self) -> Option<NodeId> {
        self.bound().as_ref().map(|b| b.identity.clone())
    }

    fn bound(&self) -> RwLockReadGuard<'_, Option<Bound>> {
        self.bound.read().unwrap_or_else(|e| e.into_inner())
    }

    fn bound_mut(&self) -> RwLockWriteGuard<'_, Option<Bound>> {
        self.bound.write().unwrap_or_else(|e| e.into_inner())
    }

    fn with_endpoint(&self, endpoint: &EndpointHandle, f: impl FnOnce(&mut Bound)) {
        match self.bound_mut().as_mut() {
            Some(bound) if bound.token == endpoint.token => f(bound),
            _ => tracing::debug!(endpoint = %endpoint.identity, "stale endpoint handle"),
        }
    }
}

impl Transport for UdpTransport {
    fn acquire_endpoint(&self, identity: &NodeId) -> Result<EndpointHandle> {
        let mut bound = self.bound_mut();
        if let Some(existing) = bound.as_ref() {
            bail!("transport already bound to {}", existing.identity);
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        *bound = Some(Bound {
            token,
            identity: identity.clone(),
            subscriber: None,
            handlers: HashMap::new(),
        });

        // A wildcard bind is not dialable; peers learn our address from the
        // datagram source instead.
        let address = (!self.local_addr.ip().is_unspecified())
            .then(|| EndpointAddress::new(self.local_addr.to_string()));
        Ok(EndpointHandle {
            token,
            identity: identity.clone(),
            address,
        })
    }

    fn release_endpoint(&self, endpoint: &EndpointHandle) {
        let mut bound = self.bound_mut();
        if bound.as_ref().map(|b| b.token) != Some(endpoint.token) {
            return;
        }
        let bye = Frame::Bye {
            identity: endpoint.identity.clone(),
        };
        for entry in self.sessions.iter() {
            if let Err(e) = self.transmit(*entry.value(), &bye) {
                tracing::debug!(peer = %entry.key(), error = %e, "bye not sent");
            }
        }
        self.sessions.clear();
        self.by_addr.clear();
        *bound = None;
    }

    fn subscribe(&self, endpoint: &EndpointHandle, adapter: SessionEventAdapter) {
        self.with_endpoint(endpoint, |b| b.subscriber = Some(adapter));
    }

    fn register_handler(&self, endpoint: &EndpointHandle, method: &'static str, adapter: SessionEventAdapter) {
        self.with_endpoint(endpoint, |b| {
            b.handlers.insert(method, adapter);
        });
    }

    fn unsubscribe(&self, endpoint: &EndpointHandle) {
        self.with_endpoint(endpoint, |b| {
            b.subscriber = None;
            b.handlers.clear();
        });
    }

    fn connect(&self, from: &EndpointHandle, peer: &NodeId, address: &EndpointAddress) -> Result<()> {
        if self.sessions.contains_key(peer) {
            return Ok(());
        }
        let addr: SocketAddr = address
            .as_str()
            .parse()
            .with_context(|| format!("not a socket address: {address}"))?;
        self.transmit(
            addr,
            &Frame::Hello {
                identity: from.identity.clone(),
            },
        )
    }

    fn send(&self, _from: &EndpointHandle, peer: &NodeId, payload: Bytes) -> Result<()> {
        let Some(addr) = self.sessions.get(peer).map(|e| *e.value()) else {
            bail!("no session with {peer}");
        };
        self.transmit(
            addr,
            &Frame::Data {
                payload: hex::encode(&payload),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use meshwatch_core::wire::methods;
    use meshwatch_core::{DiscoveryMessage, EndpointState, PeerListEntry};
    use meshwatch_discovery::DiscoveryEvent;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;

    async fn next(rx: &mut UnboundedReceiver<DiscoveryEvent>) -> DiscoveryEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    async fn node(
        name: &str,
        shutdown: &broadcast::Sender<()>,
    ) -> (Arc<UdpTransport>, EndpointHandle, UnboundedReceiver<DiscoveryEvent>) {
        let transport = Arc::new(UdpTransport::bind("127.0.0.1:0").await.unwrap());
        tokio::spawn(transport.clone().run(shutdown.subscribe()));
        let handle = transport.acquire_endpoint(&NodeId::from(name)).unwrap();
        let (adapter, rx) = SessionEventAdapter::channel();
        transport.subscribe(&handle, adapter.clone());
        for method in methods::ALL {
            transport.register_handler(&handle, method, adapter.clone());
        }
        (transport, handle, rx)
    }

    #[test]
    fn frame_shape() {
        let json = serde_json::to_value(Frame::Hello { identity: NodeId::from("a") }).unwrap();
        assert_eq!(json, serde_json::json!({"frame": "hello", "identity": "a"}));
    }

    #[tokio::test]
    async fn second_acquire_is_refused() {
        let transport = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let handle = transport.acquire_endpoint(&NodeId::from("a")).unwrap();
        assert_eq!(handle.address, Some(EndpointAddress::new(transport.local_addr().to_string())));
        assert!(transport.acquire_endpoint(&NodeId::from("b")).is_err());
        transport.release_endpoint(&handle);
        assert!(transport.acquire_endpoint(&NodeId::from("b")).is_ok());
    }

    #[tokio::test]
    async fn hello_welcome_data_bye() {
        let (shutdown, _) = broadcast::channel(1);
        let (a, ha, mut ra) = node("a", &shutdown).await;
        let (b, _hb, mut rb) = node("b", &shutdown).await;

        let b_addr = EndpointAddress::new(b.local_addr().to_string());
        a.connect(&ha, &NodeId::from("b"), &b_addr).unwrap();

        assert_eq!(
            next(&mut rb).await,
            DiscoveryEvent::SessionEstablished { identity: NodeId::from("a"), direction: Direction::Inbound }
        );
        assert!(matches!(next(&mut rb).await, DiscoveryEvent::NewEndpoint { .. }));
        assert_eq!(
            next(&mut ra).await,
            DiscoveryEvent::SessionEstablished { identity: NodeId::from("b"), direction: Direction::Outbound }
        );
        assert_eq!(
            next(&mut ra).await,
            DiscoveryEvent::NewEndpoint { identity: NodeId::from("b"), address: b_addr }
        );

        let payload = Bytes::from(DiscoveryMessage::GetPeersRequest { requester: NodeId::from("a") }.to_bytes());
        a.send(&ha, &NodeId::from("b"), payload.clone()).unwrap();
        assert_eq!(
            next(&mut rb).await,
            DiscoveryEvent::Message { from: NodeId::from("a"), payload }
        );

        a.release_endpoint(&ha);
        assert_eq!(
            next(&mut rb).await,
            DiscoveryEvent::SessionClosed { identity: NodeId::from("a") }
        );
        assert_eq!(b.session_count(), 0);
        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn queued_frames_are_written_on_shutdown() {
        let (stop_a, _) = broadcast::channel(1);
        let (shutdown, _) = broadcast::channel(1);
        let (a, ha, _ra) = node("a", &stop_a).await;
        let (b, _hb, mut rb) = node("b", &shutdown).await;

        // Queued before a's loop has run once, then a is told to stop.
        let b_addr = EndpointAddress::new(b.local_addr().to_string());
        a.connect(&ha, &NodeId::from("b"), &b_addr).unwrap();
        let _ = stop_a.send(());

        assert_eq!(
            next(&mut rb).await,
            DiscoveryEvent::SessionEstablished { identity: NodeId::from("a"), direction: Direction::Inbound }
        );
        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn second_run_is_refused() {
        let (shutdown, _) = broadcast::channel(1);
        let transport = Arc::new(UdpTransport::bind("127.0.0.1:0").await.unwrap());
        tokio::spawn(transport.clone().run(shutdown.subscribe()));
        tokio::task::yield_now().await;
        assert!(transport.clone().run(shutdown.subscribe()).await.is_err());
        let _ = shutdown.send(());
    }

    #[test]
    fn full_peer_list_fits_one_datagram() {
        let entries = (0..MAX_PEERS_PER_DATAGRAM)
            .map(|i| PeerListEntry {
                identity: NodeId::from(format!("{i:064x}").as_str()),
                address: Some(EndpointAddress::new(format!(
                    "[ffff:ffff:ffff:ffff:ffff:ffff:ffff:{i:04x}]:65535"
                ))),
                state: EndpointState::Unreachable,
            })
            .collect();
        let payload = DiscoveryMessage::GetPeersResponse { entries }.to_bytes();
        let frame = serde_json::to_vec(&Frame::Data { payload: hex::encode(payload) }).unwrap();
        assert!(frame.len() <= MAX_DATAGRAM, "{} bytes", frame.len());
    }

    #[tokio::test]
    async fn oversized_frame_is_refused() {
        let transport = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let frame = Frame::Data { payload: "0".repeat(MAX_DATAGRAM) };
        assert!(transport.transmit(transport.local_addr(), &frame).is_err());
    }

    #[tokio::test]
    async fn send_without_session_fails() {
        let transport = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let handle = transport.acquire_endpoint(&NodeId::from("a")).unwrap();
        assert!(transport.send(&handle, &NodeId::from("b"), Bytes::from_static(b"{}")).is_err());
    }
}
