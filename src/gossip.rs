//! Gossip protocol: flood-with-dedup propagation of transactions, blocks
//! and attestations.

use crate::blockchain::{Attestation, Block};
use crate::cache::SeenCache;
use crate::config::GossipConfig;
use crate::error::ChainError;
use crate::network::{AttestPayload, BlockPayload, Message, MessageType, PeerInfo, PeerManager};
use crate::transaction::Transaction;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// What the application decided about an inbound item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    /// Relay to every other peer
    Forward,
    /// Keep it local
    Drop,
}

pub type TransactionCallback = Arc<dyn Fn(Transaction, &PeerInfo) -> Propagation + Send + Sync>;
pub type BlockCallback = Arc<dyn Fn(Block, &PeerInfo) -> Propagation + Send + Sync>;
pub type AttestationCallback = Arc<dyn Fn(Attestation, &PeerInfo) -> Propagation + Send + Sync>;

pub struct GossipProtocol {
    peers: Arc<PeerManager>,
    config: GossipConfig,
    seen: SeenCache,
    on_transaction: RwLock<Option<TransactionCallback>>,
    on_block: RwLock<Option<BlockCallback>>,
    on_attestation: RwLock<Option<AttestationCallback>>,
}

impl GossipProtocol {
    /// Creates the protocol and registers its TX, BLOCK and ATTEST handlers
    /// with `peers`.
    pub fn new(peers: Arc<PeerManager>, config: GossipConfig) -> Arc<Self> {
        let seen = SeenCache::new(config.seen_cache_size, config.seen_ttl());
        let gossip = Arc::new(GossipProtocol {
            peers: Arc::clone(&peers),
            config,
            seen,
            on_transaction: RwLock::new(None),
            on_block: RwLock::new(None),
            on_attestation: RwLock::new(None),
        });

        let weak = Arc::downgrade(&gossip);
        peers.register_handler(MessageType::Tx, move |message, peer| {
            let gossip = Weak::upgrade(&weak);
            async move {
                if let Some(gossip) = gossip {
                    gossip.handle_transaction(message, peer);
                }
            }
        });
        let weak = Arc::downgrade(&gossip);
        peers.register_handler(MessageType::Block, move |message, peer| {
            let gossip = Weak::upgrade(&weak);
            async move {
                if let Some(gossip) = gossip {
                    gossip.handle_block(message, peer);
                }
            }
        });
        let weak = Arc::downgrade(&gossip);
        peers.register_handler(MessageType::Attest, move |message, peer| {
            let gossip = Weak::upgrade(&weak);
            async move {
                if let Some(gossip) = gossip {
                    gossip.handle_attestation(message, peer);
                }
            }
        });

        gossip
    }

    pub fn config(&self) -> &GossipConfig {
        &self.config
    }

    pub fn on_transaction<F>(&self, callback: F)
    where
        F: Fn(Transaction, &PeerInfo) -> Propagation + Send + Sync + 'static,
    {
        *self.on_transaction.write() = Some(Arc::new(callback));
    }

    pub fn on_block<F>(&self, callback: F)
    where
        F: Fn(Block, &PeerInfo) -> Propagation + Send + Sync + 'static,
    {
        *self.on_block.write() = Some(Arc::new(callback));
    }

    pub fn on_attestation<F>(&self, callback: F)
    where
        F: Fn(Attestation, &PeerInfo) -> Propagation + Send + Sync + 'static,
    {
        *self.on_attestation.write() = Some(Arc::new(callback));
    }

    /// True if `id` was observed within the TTL window.
    pub fn is_seen(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    /// Records `id`. Returns false if it was already seen.
    pub fn mark_seen(&self, id: &str) -> bool {
        self.seen.insert(id)
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    /// Sends a locally originated transaction to all peers unless it has
    /// already gone out. Returns the number of peers it was queued for.
    pub fn broadcast_transaction(&self, tx: &Transaction) -> Result<usize, ChainError> {
        let tx_id = tx.tx_id();
        if !self.mark_seen(&tx_id) {
            return Ok(0);
        }
        let message = Message::new(MessageType::Tx, tx, self.peers.node_address().clone())?;
        let sent = self.peers.broadcast(&message, None);
        debug!("Broadcast tx {}... to {} peers", &tx_id[..16], sent);
        Ok(sent)
    }

    pub fn broadcast_block(&self, block: &Block) -> Result<usize, ChainError> {
        let block_id = block.block_id();
        if !self.mark_seen(&block_id) {
            return Ok(0);
        }
        let message = Message::new(
            MessageType::Block,
            &BlockPayload::from_block(block),
            self.peers.node_address().clone(),
        )?;
        let sent = self.peers.broadcast(&message, None);
        info!("Broadcast block {} ({}...) to {} peers", block.height(), block_id, sent);
        Ok(sent)
    }

    pub fn broadcast_attestation(&self, attestation: &Attestation) -> Result<usize, ChainError> {
        if !self.mark_seen(&attestation_id(attestation)) {
            return Ok(0);
        }
        let message = Message::new(
            MessageType::Attest,
            &AttestPayload {
                attestation: attestation.clone(),
            },
            self.peers.node_address().clone(),
        )?;
        Ok(self.peers.broadcast(&message, None))
    }

    fn handle_transaction(&self, message: Message, peer: PeerInfo) {
        let tx: Transaction = match message.payload_as() {
            Ok(tx) => tx,
            Err(e) => {
                warn!("Error handling tx from {}: {}", peer.address, e);
                return;
            }
        };
        if !self.mark_seen(&tx.tx_id()) {
            return;
        }
        let callback = self.on_transaction.read().clone();
        let verdict = callback.map_or(Propagation::Forward, |cb| cb(tx, &peer));
        self.relay(verdict, &message, &peer);
    }

    fn handle_block(&self, message: Message, peer: PeerInfo) {
        let payload: BlockPayload = match message
            .payload_as::<BlockPayload>()
            .and_then(|p| p.verify_summary().map(|_| p))
        {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Error handling block from {}: {}", peer.address, e);
                return;
            }
        };
        if !self.mark_seen(&payload.block_id()) {
            return;
        }
        info!("Received block {} from {}", payload.height, peer.address);
        let callback = self.on_block.read().clone();
        let verdict = callback.map_or(Propagation::Forward, |cb| cb(payload.block, &peer));
        self.relay(verdict, &message, &peer);
    }

    fn handle_attestation(&self, message: Message, peer: PeerInfo) {
        let payload: AttestPayload = match message.payload_as() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Error handling attestation from {}: {}", peer.address, e);
                return;
            }
        };
        if !self.mark_seen(&attestation_id(&payload.attestation)) {
            return;
        }
        let callback = self.on_attestation.read().clone();
        let verdict = callback.map_or(Propagation::Forward, |cb| cb(payload.attestation, &peer));
        self.relay(verdict, &message, &peer);
    }

    fn relay(&self, verdict: Propagation, message: &Message, from: &PeerInfo) {
        if verdict == Propagation::Forward {
            let sent = self.peers.broadcast(message, Some(&from.address));
            debug!("Relayed {:?} from {} to {} peers", message.msg_type, from.address, sent);
        }
    }
}

fn attestation_id(attestation: &Attestation) -> String {
    format!(
        "{}:{}",
        attestation.validator,
        &hex::encode(attestation.block_hash)[..16]
    )
}
