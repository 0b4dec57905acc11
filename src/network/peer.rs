//! Peer connection lifecycle and message dispatch.

use super::message::{
    read_message, write_message, HeartbeatPayload, HelloAckPayload, HelloPayload, Message,
    MessageType, PeersPayload, PROTOCOL_VERSION,
};
use crate::config::NetworkConfig;
use crate::crypto::Address;
use crate::error::ChainError;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};

pub const INITIAL_REPUTATION: i32 = 100;

/// Per-peer outbound queue depth; messages beyond it are dropped.
const OUTBOUND_QUEUE: usize = 1024;

pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type MessageHandler = Arc<dyn Fn(Message, PeerInfo) -> HandlerFuture + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
    pub address: Address,
    pub host: String,
    /// Port the peer accepts connections on
    pub port: u16,
    /// Local clock, unix millis, of the last frame received
    pub last_seen: u64,
    pub latency_ms: u64,
    pub height: u64,
    pub reputation: i32,
    pub inbound: bool,
}

impl PeerInfo {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

struct PeerHandle {
    info: PeerInfo,
    outbound: mpsc::Sender<Message>,
    closer: Arc<Notify>,
    ping_sent_at: Option<u64>,
}

/// Owns every peer connection: one accept loop, one read loop and one
/// writer task per peer, and a periodic maintenance task.
///
/// The registry sits behind a synchronous lock that is never held across
/// an await; outbound messages go through each peer's queue.
pub struct PeerManager {
    node_address: Address,
    config: NetworkConfig,
    peers: RwLock<HashMap<Address, PeerHandle>>,
    known_endpoints: RwLock<HashSet<String>>,
    handlers: RwLock<HashMap<MessageType, MessageHandler>>,
    local_height: AtomicU64,
    local_addr: RwLock<Option<SocketAddr>>,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl PeerManager {
    pub fn new(node_address: Address, config: NetworkConfig) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(PeerManager {
            node_address,
            config,
            peers: RwLock::new(HashMap::new()),
            known_endpoints: RwLock::new(HashSet::new()),
            handlers: RwLock::new(HashMap::new()),
            local_height: AtomicU64::new(0),
            local_addr: RwLock::new(None),
            running: AtomicBool::new(false),
            shutdown,
        })
    }

    pub fn node_address(&self) -> &Address {
        &self.node_address
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Installs the callback for `msg_type`, replacing any previous one.
    /// Callbacks run on the read loop of the peer the message came from.
    pub fn register_handler<F, Fut>(&self, msg_type: MessageType, handler: F)
    where
        F: Fn(Message, PeerInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: MessageHandler =
            Arc::new(move |message: Message, peer: PeerInfo| -> HandlerFuture {
                Box::pin(handler(message, peer))
            });
        self.handlers.write().insert(msg_type, handler);
    }

    pub fn set_local_height(&self, height: u64) {
        self.local_height.store(height, Ordering::SeqCst);
    }

    pub fn local_height(&self) -> u64 {
        self.local_height.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    fn listen_port(&self) -> u16 {
        self.local_addr().map_or(self.config.p2p_port, |a| a.port())
    }

    /// Binds the listener, dials the bootstrap peers and starts maintenance.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, ChainError> {
        let bind_addr = self.config.listen_addr();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| ChainError::NetworkError(format!("Failed to bind {}: {}", bind_addr, e)))?;
        let local = listener.local_addr()?;
        *self.local_addr.write() = Some(local);
        self.running.store(true, Ordering::SeqCst);
        self.shutdown.send_replace(false);
        info!("Listening for peers on {}", local);

        tokio::spawn(Arc::clone(self).accept_loop(listener));

        for endpoint in &self.config.bootstrap_peers {
            self.add_known_endpoint(endpoint);
            if let Err(e) = self.connect(endpoint).await {
                warn!("Failed to connect to bootstrap peer {}: {}", endpoint, e);
            }
        }

        tokio::spawn(Arc::clone(self).maintenance_loop());
        Ok(local)
    }

    /// Stops all loops and closes every connection without draining.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.send_replace(true);
        let handles: Vec<PeerHandle> = self.peers.write().drain().map(|(_, h)| h).collect();
        for handle in &handles {
            handle.closer.notify_one();
        }
        info!("Peer manager stopped, closed {} connections", handles.len());
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        while self.is_running() {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let manager = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = manager.handle_inbound(stream, remote).await {
                                warn!("Inbound connection from {} failed: {}", remote, e);
                            }
                        });
                    }
                    Err(e) => warn!("Accept failed: {}", e),
                },
            }
        }
        debug!("Accept loop stopped");
    }

    async fn handle_inbound(self: Arc<Self>, stream: TcpStream, remote: SocketAddr) -> Result<(), ChainError> {
        if self.peer_count() >= self.config.max_peers {
            return Err(ChainError::NetworkError("Peer limit reached".to_string()));
        }
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let hello = self.read_handshake(&mut reader).await?;
        if hello.msg_type != MessageType::Hello {
            return Err(ChainError::NetworkError(format!(
                "Expected hello, got {:?}",
                hello.msg_type
            )));
        }
        let payload: HelloPayload = hello.payload_as()?;
        self.check_remote(&payload.address, payload.network_id)?;

        let ack = Message::new(
            MessageType::HelloAck,
            &HelloAckPayload {
                address: self.node_address.clone(),
                network_id: self.config.network_id,
                height: self.local_height(),
            },
            self.node_address.clone(),
        )?;
        write_message(&mut write_half, &ack).await?;

        let info = PeerInfo {
            address: payload.address,
            host: remote.ip().to_string(),
            port: payload.port,
            last_seen: now_millis(),
            latency_ms: 0,
            height: payload.height,
            reputation: INITIAL_REPUTATION,
            inbound: true,
        };
        self.add_known_endpoint(&info.endpoint());
        let closer = self.register_peer(info.clone(), write_half)?;
        info!("Accepted connection from {} ({})", info.address, info.endpoint());

        self.share_peers(&info.address);
        self.read_loop(reader, info.address, closer).await;
        Ok(())
    }

    /// Dials `endpoint` (`host:port`) and performs the HELLO handshake.
    pub async fn connect(self: &Arc<Self>, endpoint: &str) -> Result<PeerInfo, ChainError> {
        if self.peer_count() >= self.config.max_peers {
            return Err(ChainError::NetworkError("Peer limit reached".to_string()));
        }
        if self.is_connected_endpoint(endpoint) {
            return Err(ChainError::NetworkError(format!("Already connected to {}", endpoint)));
        }
        let (host, port) = parse_endpoint(endpoint)?;

        let stream = tokio::time::timeout(self.config.handshake_timeout(), TcpStream::connect(endpoint))
            .await
            .map_err(|_| ChainError::NetworkError(format!("Connection to {} timed out", endpoint)))?
            .map_err(|e| ChainError::NetworkError(format!("Connection to {} failed: {}", endpoint, e)))?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let hello = Message::new(
            MessageType::Hello,
            &HelloPayload {
                address: self.node_address.clone(),
                port: self.listen_port(),
                version: PROTOCOL_VERSION.to_string(),
                network_id: self.config.network_id,
                height: self.local_height(),
            },
            self.node_address.clone(),
        )?;
        let started = now_millis();
        write_message(&mut write_half, &hello).await?;

        let response = self.read_handshake(&mut reader).await?;
        if response.msg_type != MessageType::HelloAck {
            return Err(ChainError::NetworkError(format!(
                "Expected hello_ack, got {:?}",
                response.msg_type
            )));
        }
        let ack: HelloAckPayload = response.payload_as()?;
        self.check_remote(&ack.address, ack.network_id)?;

        let now = now_millis();
        let info = PeerInfo {
            address: ack.address,
            host,
            port,
            last_seen: now,
            latency_ms: now.saturating_sub(started),
            height: ack.height,
            reputation: INITIAL_REPUTATION,
            inbound: false,
        };
        self.add_known_endpoint(endpoint);
        let closer = self.register_peer(info.clone(), write_half)?;
        info!("Connected to peer {} at {}", info.address, endpoint);

        self.share_peers(&info.address);
        let manager = Arc::clone(self);
        let address = info.address.clone();
        tokio::spawn(async move {
            manager.read_loop(reader, address, closer).await;
        });
        Ok(info)
    }

    async fn read_handshake(&self, reader: &mut BufReader<OwnedReadHalf>) -> Result<Message, ChainError> {
        tokio::time::timeout(self.config.handshake_timeout(), read_message(reader))
            .await
            .map_err(|_| ChainError::NetworkError("Handshake timed out".to_string()))??
            .ok_or_else(|| ChainError::NetworkError("Connection closed during handshake".to_string()))
    }

    fn check_remote(&self, address: &Address, network_id: u32) -> Result<(), ChainError> {
        if network_id != self.config.network_id {
            return Err(ChainError::NetworkError(format!(
                "Peer {} is on network {:#x}",
                address, network_id
            )));
        }
        if address == &self.node_address {
            return Err(ChainError::NetworkError("Refusing connection to self".to_string()));
        }
        if self.peers.read().contains_key(address) {
            return Err(ChainError::NetworkError(format!("Already connected to {}", address)));
        }
        Ok(())
    }

    fn register_peer(&self, info: PeerInfo, writer: OwnedWriteHalf) -> Result<Arc<Notify>, ChainError> {
        let (outbound, queue) = mpsc::channel(OUTBOUND_QUEUE);
        let closer = Arc::new(Notify::new());
        {
            let mut peers = self.peers.write();
            if peers.contains_key(&info.address) {
                return Err(ChainError::NetworkError(format!(
                    "Already connected to {}",
                    info.address
                )));
            }
            if peers.len() >= self.config.max_peers {
                return Err(ChainError::NetworkError("Peer limit reached".to_string()));
            }
            peers.insert(
                info.address.clone(),
                PeerHandle {
                    info: info.clone(),
                    outbound,
                    closer: Arc::clone(&closer),
                    ping_sent_at: None,
                },
            );
        }
        tokio::spawn(write_loop(writer, queue, info.address));
        Ok(closer)
    }

    async fn read_loop(&self, mut reader: BufReader<OwnedReadHalf>, address: Address, closer: Arc<Notify>) {
        let mut shutdown = self.shutdown.subscribe();
        let read_timeout = self.config.read_timeout();
        while self.is_running() {
            let next = tokio::select! {
                _ = closer.notified() => break,
                _ = shutdown.changed() => break,
                next = tokio::time::timeout(read_timeout, read_message(&mut reader)) => next,
            };
            match next {
                Err(_) => {
                    debug!("No traffic from {} for {:?}, sending ping", address, read_timeout);
                    self.send_heartbeat(&address, MessageType::Ping);
                }
                Ok(Ok(Some(message))) => {
                    let Some(peer) = self.touch_peer(&address) else {
                        break;
                    };
                    self.dispatch(message, peer).await;
                }
                Ok(Ok(None)) => break,
                Ok(Err(ChainError::Serialization(e))) => {
                    warn!("Dropping malformed message from {}: {}", address, e);
                }
                Ok(Err(e)) => {
                    warn!("Error reading from {}: {}", address, e);
                    break;
                }
            }
        }
        if self.release(&address, &closer) {
            info!("Disconnected from {}", address);
        }
    }

    /// Drops the registry entry for `address` only while it still belongs
    /// to the connection owning `closer`; a newer connection from the same
    /// peer is left alone.
    fn release(&self, address: &Address, closer: &Arc<Notify>) -> bool {
        let mut peers = self.peers.write();
        match peers.get(address) {
            Some(handle) if Arc::ptr_eq(&handle.closer, closer) => {
                peers.remove(address);
                true
            }
            _ => false,
        }
    }

    async fn dispatch(&self, message: Message, peer: PeerInfo) {
        match message.msg_type {
            MessageType::Ping => {
                if let Ok(heartbeat) = message.payload_as::<HeartbeatPayload>() {
                    self.update_peer_height(&peer.address, heartbeat.height);
                }
                self.send_heartbeat(&peer.address, MessageType::Pong);
            }
            MessageType::Pong => {
                if let Ok(heartbeat) = message.payload_as::<HeartbeatPayload>() {
                    self.update_peer_height(&peer.address, heartbeat.height);
                }
                self.record_pong(&peer.address);
            }
            MessageType::Peers => match message.payload_as::<PeersPayload>() {
                Ok(peers) => {
                    for endpoint in peers.endpoints.iter().filter(|e| parse_endpoint(e).is_ok()) {
                        self.add_known_endpoint(endpoint);
                    }
                }
                Err(e) => warn!("Bad peers list from {}: {}", peer.address, e),
            },
            MessageType::Hello | MessageType::HelloAck => {
                debug!("Ignoring repeated handshake from {}", peer.address);
            }
            _ => {}
        }

        let handler = self.handlers.read().get(&message.msg_type).cloned();
        if let Some(handler) = handler {
            handler(message, peer).await;
        }
    }

    fn send_heartbeat(&self, address: &Address, msg_type: MessageType) {
        let heartbeat = HeartbeatPayload {
            height: self.local_height(),
        };
        let result = Message::new(msg_type, &heartbeat, self.node_address.clone())
            .and_then(|message| self.send_to(address, message));
        match result {
            Ok(()) if msg_type == MessageType::Ping => {
                if let Some(handle) = self.peers.write().get_mut(address) {
                    handle.ping_sent_at = Some(now_millis());
                }
            }
            Ok(()) => {}
            Err(e) => debug!("Heartbeat to {} failed: {}", address, e),
        }
    }

    fn record_pong(&self, address: &Address) {
        if let Some(handle) = self.peers.write().get_mut(address) {
            if let Some(sent_at) = handle.ping_sent_at.take() {
                handle.info.latency_ms = now_millis().saturating_sub(sent_at);
            }
        }
    }

    fn touch_peer(&self, address: &Address) -> Option<PeerInfo> {
        let mut peers = self.peers.write();
        let handle = peers.get_mut(address)?;
        handle.info.last_seen = now_millis();
        Some(handle.info.clone())
    }

    fn share_peers(&self, address: &Address) {
        let exclude = self.peer(address).map(|p| p.endpoint());
        let endpoints: Vec<String> = self
            .known_endpoints()
            .into_iter()
            .filter(|e| Some(e) != exclude.as_ref())
            .collect();
        if endpoints.is_empty() {
            return;
        }
        let result = Message::new(
            MessageType::Peers,
            &PeersPayload { endpoints },
            self.node_address.clone(),
        )
        .and_then(|message| self.send_to(address, message));
        if let Err(e) = result {
            debug!("Failed to share peers with {}: {}", address, e);
        }
    }

    /// Queues `message` for one peer.
    pub fn send_to(&self, address: &Address, message: Message) -> Result<(), ChainError> {
        let peers = self.peers.read();
        let handle = peers
            .get(address)
            .ok_or_else(|| ChainError::NetworkError(format!("Unknown peer {}", address)))?;
        handle
            .outbound
            .try_send(message)
            .map_err(|e| ChainError::NetworkError(format!("Send to {} failed: {}", address, e)))
    }

    /// Queues `message` for every peer except `exclude`. Returns how many
    /// peers it was queued for.
    pub fn broadcast(&self, message: &Message, exclude: Option<&Address>) -> usize {
        let peers = self.peers.read();
        let mut sent = 0;
        for (address, handle) in peers.iter() {
            if Some(address) == exclude {
                continue;
            }
            match handle.outbound.try_send(message.clone()) {
                Ok(()) => sent += 1,
                Err(e) => warn!("Failed to send {:?} to {}: {}", message.msg_type, address, e),
            }
        }
        sent
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().values().map(|h| h.info.clone()).collect()
    }

    pub fn peer(&self, address: &Address) -> Option<PeerInfo> {
        self.peers.read().get(address).map(|h| h.info.clone())
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Peer reporting the greatest height strictly above `height`.
    pub fn best_peer(&self, height: u64) -> Option<PeerInfo> {
        self.peers
            .read()
            .values()
            .filter(|h| h.info.height > height)
            .max_by_key(|h| h.info.height)
            .map(|h| h.info.clone())
    }

    pub fn update_peer_height(&self, address: &Address, height: u64) {
        if let Some(handle) = self.peers.write().get_mut(address) {
            handle.info.height = height;
        }
    }

    /// Lowers a peer's reputation; at zero the peer is disconnected.
    /// Returns the new score, or `None` if the peer is unknown.
    pub fn penalize(&self, address: &Address, amount: i32) -> Option<i32> {
        let reputation = {
            let mut peers = self.peers.write();
            let handle = peers.get_mut(address)?;
            handle.info.reputation = handle.info.reputation.saturating_sub(amount);
            handle.info.reputation
        };
        if reputation <= 0 {
            warn!("Disconnecting {}: reputation exhausted", address);
            self.disconnect(address);
        }
        Some(reputation)
    }

    /// Drops a peer and closes its connection. Returns false if unknown.
    pub fn disconnect(&self, address: &Address) -> bool {
        let handle = self.peers.write().remove(address);
        match handle {
            Some(handle) => {
                handle.closer.notify_one();
                true
            }
            None => false,
        }
    }

    pub fn add_known_endpoint(&self, endpoint: &str) {
        self.known_endpoints.write().insert(endpoint.to_string());
    }

    pub fn known_endpoints(&self) -> Vec<String> {
        let mut endpoints: Vec<String> = self.known_endpoints.read().iter().cloned().collect();
        endpoints.sort();
        endpoints
    }

    fn is_connected_endpoint(&self, endpoint: &str) -> bool {
        self.peers
            .read()
            .values()
            .any(|h| h.info.endpoint() == endpoint)
    }

    fn is_own_endpoint(&self, endpoint: &str) -> bool {
        match (self.local_addr(), endpoint.parse::<SocketAddr>()) {
            (Some(local), Ok(remote)) => {
                local.port() == remote.port()
                    && (local.ip() == remote.ip() || local.ip().is_unspecified() || remote.ip().is_loopback())
            }
            _ => false,
        }
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.maintenance_interval());
        // the first tick completes immediately
        ticker.tick().await;
        while self.is_running() {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            self.maintain().await;
        }
        debug!("Maintenance loop stopped");
    }

    /// Drops stale peers, then dials known endpoints until the target
    /// peer count is reached.
    pub async fn maintain(self: &Arc<Self>) {
        let cutoff = now_millis().saturating_sub(self.config.stale_peer_secs.saturating_mul(1000));
        let stale: Vec<Address> = self
            .peers
            .read()
            .values()
            .filter(|h| h.info.last_seen < cutoff)
            .map(|h| h.info.address.clone())
            .collect();
        for address in stale {
            info!("Removing stale peer {}", address);
            self.disconnect(&address);
        }

        if self.peer_count() >= self.config.target_peers {
            return;
        }
        for endpoint in self.known_endpoints() {
            if self.peer_count() >= self.config.target_peers {
                break;
            }
            if self.is_connected_endpoint(&endpoint) || self.is_own_endpoint(&endpoint) {
                continue;
            }
            if let Err(e) = self.connect(&endpoint).await {
                debug!("Maintenance dial to {} failed: {}", endpoint, e);
            }
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut queue: mpsc::Receiver<Message>, address: Address) {
    while let Some(message) = queue.recv().await {
        if let Err(e) = write_message(&mut writer, &message).await {
            debug!("Write to {} failed: {}", address, e);
            break;
        }
    }
}

fn parse_endpoint(endpoint: &str) -> Result<(String, u16), ChainError> {
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| ChainError::NetworkError(format!("Bad endpoint: {}", endpoint)))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| ChainError::NetworkError(format!("Bad endpoint port: {}", endpoint)))?;
    if host.is_empty() {
        return Err(ChainError::NetworkError(format!("Bad endpoint host: {}", endpoint)));
    }
    Ok((host.to_string(), port))
}

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use std::time::Duration;

    fn local_config() -> NetworkConfig {
        NetworkConfig {
            listen_host: "127.0.0.1".to_string(),
            p2p_port: 0,
            ..NetworkConfig::default()
        }
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(parse_endpoint("127.0.0.1:9000").unwrap(), ("127.0.0.1".to_string(), 9000));
        assert!(parse_endpoint("localhost").is_err());
        assert!(parse_endpoint(":9000").is_err());
        assert!(parse_endpoint("host:99999").is_err());
    }

    fn detached_handle(address: &Address) -> (PeerHandle, Arc<Notify>) {
        let (outbound, _queue) = mpsc::channel(1);
        let closer = Arc::new(Notify::new());
        let info = PeerInfo {
            address: address.clone(),
            host: "127.0.0.1".to_string(),
            port: 9000,
            last_seen: 0,
            latency_ms: 0,
            height: 0,
            reputation: INITIAL_REPUTATION,
            inbound: true,
        };
        let handle = PeerHandle {
            info,
            outbound,
            closer: Arc::clone(&closer),
            ping_sent_at: None,
        };
        (handle, closer)
    }

    #[test]
    fn test_stale_read_loop_keeps_reconnected_peer() {
        let manager = PeerManager::new(KeyPair::generate().address(), local_config());
        let remote = KeyPair::generate().address();

        let (first, first_closer) = detached_handle(&remote);
        manager.peers.write().insert(remote.clone(), first);
        assert!(manager.disconnect(&remote));

        let (second, second_closer) = detached_handle(&remote);
        manager.peers.write().insert(remote.clone(), second);

        // the first connection's loop winds down after the peer came back
        assert!(!manager.release(&remote, &first_closer));
        assert_eq!(manager.peer_count(), 1);

        assert!(manager.release(&remote, &second_closer));
        assert_eq!(manager.peer_count(), 0);
        assert!(!manager.release(&remote, &second_closer));
    }

    #[tokio::test]
    async fn test_stale_cutoff_with_huge_window() {
        let remote = KeyPair::generate().address();
        let patient = PeerManager::new(
            KeyPair::generate().address(),
            NetworkConfig {
                stale_peer_secs: u64::MAX,
                ..local_config()
            },
        );
        patient.peers.write().insert(remote.clone(), detached_handle(&remote).0);
        patient.maintain().await;
        assert_eq!(patient.peer_count(), 1);

        let strict = PeerManager::new(
            KeyPair::generate().address(),
            NetworkConfig {
                stale_peer_secs: 1,
                ..local_config()
            },
        );
        strict.peers.write().insert(remote.clone(), detached_handle(&remote).0);
        strict.maintain().await;
        assert_eq!(strict.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_handshake_and_dispatch() {
        tokio::time::timeout(Duration::from_secs(10), async {
            let a = PeerManager::new(KeyPair::generate().address(), local_config());
            let b = PeerManager::new(KeyPair::generate().address(), local_config());
            b.set_local_height(7);

            let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
            b.register_handler(MessageType::Tx, move |message, peer| {
                let seen_tx = seen_tx.clone();
                async move {
                    let _ = seen_tx.send((message, peer));
                }
            });

            a.start().await.unwrap();
            let b_addr = b.start().await.unwrap();

            let info = a.connect(&b_addr.to_string()).await.unwrap();
            assert_eq!(&info.address, b.node_address());
            assert_eq!(info.height, 7);
            assert_eq!(info.reputation, INITIAL_REPUTATION);
            wait_for(|| b.peer_count() == 1).await;
            assert_eq!(a.best_peer(0).map(|p| p.height), Some(7));
            assert!(a.best_peer(7).is_none());

            let message = Message::new(MessageType::Tx, &PeersPayload::default(), a.node_address().clone()).unwrap();
            assert_eq!(a.broadcast(&message, None), 1);
            assert_eq!(a.broadcast(&message, Some(b.node_address())), 0);

            let (received, from) = seen_rx.recv().await.unwrap();
            assert_eq!(received.msg_type, MessageType::Tx);
            assert_eq!(&from.address, a.node_address());

            // duplicate connection is refused
            assert!(a.connect(&b_addr.to_string()).await.is_err());

            a.stop();
            b.stop();
        })
        .await
        .expect("test_handshake_and_dispatch timed out");
    }

    #[tokio::test]
    async fn test_penalize_disconnects_at_zero() {
        tokio::time::timeout(Duration::from_secs(10), async {
            let a = PeerManager::new(KeyPair::generate().address(), local_config());
            let b = PeerManager::new(KeyPair::generate().address(), local_config());
            a.start().await.unwrap();
            let b_addr = b.start().await.unwrap();
            a.connect(&b_addr.to_string()).await.unwrap();
            wait_for(|| b.peer_count() == 1).await;

            let b_address = b.node_address().clone();
            assert_eq!(a.penalize(&b_address, 40), Some(60));
            assert_eq!(a.peer_count(), 1);
            assert_eq!(a.penalize(&b_address, 60), Some(0));
            assert_eq!(a.peer_count(), 0);
            // the remote side notices the closed socket
            wait_for(|| b.peer_count() == 0).await;
            assert_eq!(a.penalize(&b_address, 1), None);

            a.stop();
            b.stop();
        })
        .await
        .expect("test_penalize_disconnects_at_zero timed out");
    }

    #[tokio::test]
    async fn test_rejects_foreign_network_and_self() {
        tokio::time::timeout(Duration::from_secs(10), async {
            let a = PeerManager::new(KeyPair::generate().address(), local_config());
            let mut foreign_config = local_config();
            foreign_config.network_id = 1;
            let foreign = PeerManager::new(KeyPair::generate().address(), foreign_config);

            let a_addr = a.start().await.unwrap();
            foreign.start().await.unwrap();

            assert!(foreign.connect(&a_addr.to_string()).await.is_err());
            assert!(a.connect(&a_addr.to_string()).await.is_err());
            assert_eq!(a.peer_count(), 0);

            a.stop();
            foreign.stop();
        })
        .await
        .expect("test_rejects_foreign_network_and_self timed out");
    }

    #[tokio::test]
    async fn test_peers_message_shares_endpoints() {
        tokio::time::timeout(Duration::from_secs(10), async {
            let a = PeerManager::new(KeyPair::generate().address(), local_config());
            let b = PeerManager::new(KeyPair::generate().address(), local_config());
            a.add_known_endpoint("10.0.0.5:9000");
            a.start().await.unwrap();
            let b_addr = b.start().await.unwrap();
            a.connect(&b_addr.to_string()).await.unwrap();

            wait_for(|| b.known_endpoints().contains(&"10.0.0.5:9000".to_string())).await;

            a.stop();
            b.stop();
        })
        .await
        .expect("test_peers_message_shares_endpoints timed out");
    }
}
