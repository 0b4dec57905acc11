//! Chain synchronization for lagging nodes
//!
//! This module provides:
//! - Batched block backfill from the highest peer (`ChainSync`)
//! - Announcement-driven incremental catch-up (`BlockAnnouncer`)
//! - The `ChainHandle` seam both of them apply blocks through

use crate::blockchain::{Block, Blockchain};
use crate::config::SyncConfig;
use crate::error::ChainError;
use crate::gossip::GossipProtocol;
use crate::network::{Message, MessageType, PeerInfo, PeerManager, SyncRequest, SyncResponse};
use crate::crypto::Address;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// The chain operations sync needs. Implementations serialize block
/// application behind their own lock.
pub trait ChainHandle: Send + Sync {
    fn height(&self) -> u64;

    /// Stored blocks in `[start, end]`, ascending.
    fn blocks_in_range(&self, start: u64, end: u64) -> Vec<Block>;

    /// Validates and appends `block` as the next block.
    fn apply_block(&self, block: Block) -> Result<(), ChainError>;
}

impl ChainHandle for RwLock<Blockchain> {
    fn height(&self) -> u64 {
        self.read().height()
    }

    fn blocks_in_range(&self, start: u64, end: u64) -> Vec<Block> {
        self.read().blocks_in_range(start, end)
    }

    fn apply_block(&self, block: Block) -> Result<(), ChainError> {
        self.write().apply_block(block)
    }
}

/// Sync progress snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncState {
    pub syncing: bool,
    pub target_height: u64,
    pub current_height: u64,
    pub sync_peer: Option<Address>,
    /// Blocks applied by sync since the node started
    pub blocks_synced: u64,
}

impl SyncState {
    /// Fraction of the current sync completed; 1.0 when idle.
    pub fn progress(&self) -> f64 {
        if !self.syncing || self.target_height == 0 {
            return 1.0;
        }
        (self.current_height as f64 / self.target_height as f64).min(1.0)
    }
}

/// Batched backfill from the peer reporting the greatest height.
///
/// Responses land in a pending map keyed by height; only the next expected
/// height is ever applied, so out-of-order arrivals wait and a block that
/// fails validation halts the attempt.
pub struct ChainSync {
    peers: Arc<PeerManager>,
    chain: Arc<dyn ChainHandle>,
    config: SyncConfig,
    state: Mutex<SyncState>,
    pending: Mutex<BTreeMap<u64, Block>>,
    arrived: Notify,
}

impl ChainSync {
    /// Creates the synchronizer and registers SYNC_REQ and SYNC_RES
    /// handlers with `peers`.
    pub fn new(peers: Arc<PeerManager>, chain: Arc<dyn ChainHandle>, config: SyncConfig) -> Arc<Self> {
        let sync = Arc::new(ChainSync {
            peers: Arc::clone(&peers),
            chain,
            config,
            state: Mutex::new(SyncState::default()),
            pending: Mutex::new(BTreeMap::new()),
            arrived: Notify::new(),
        });

        let weak = Arc::downgrade(&sync);
        peers.register_handler(MessageType::SyncReq, move |message, peer| {
            let sync = Weak::upgrade(&weak);
            async move {
                if let Some(sync) = sync {
                    sync.handle_sync_request(message, peer);
                }
            }
        });
        let weak = Arc::downgrade(&sync);
        peers.register_handler(MessageType::SyncRes, move |message, peer| {
            let sync = Weak::upgrade(&weak);
            async move {
                if let Some(sync) = sync {
                    sync.handle_sync_response(message, peer);
                }
            }
        });

        sync
    }

    pub fn state(&self) -> SyncState {
        self.state.lock().clone()
    }

    pub fn is_syncing(&self) -> bool {
        self.state.lock().syncing
    }

    /// Catches up with the highest peer. Returns `Ok(false)` when a sync is
    /// already running or no peer is ahead of us.
    pub async fn start_sync(&self) -> Result<bool, ChainError> {
        let (peer, target) = {
            let mut state = self.state.lock();
            if state.syncing {
                debug!("Sync already in progress");
                return Ok(false);
            }
            let local = self.chain.height();
            let Some(peer) = self.peers.best_peer(local) else {
                return Ok(false);
            };
            state.syncing = true;
            state.target_height = peer.height;
            state.current_height = local;
            state.sync_peer = Some(peer.address.clone());
            info!(
                "Starting sync from {} ({} -> {})",
                peer.address, local, peer.height
            );
            (peer.address, peer.height)
        };

        let result = self.run_sync(&peer, target).await;

        self.pending.lock().clear();
        let mut state = self.state.lock();
        state.syncing = false;
        state.sync_peer = None;
        match &result {
            Ok(()) => info!("Sync complete at height {}", state.current_height),
            Err(e) => warn!("Sync with {} failed at height {}: {}", peer, state.current_height, e),
        }
        result.map(|_| true)
    }

    /// Stops the running sync after its current wait.
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        if state.syncing {
            info!("Cancelling sync at height {}", state.current_height);
            state.syncing = false;
        }
        drop(state);
        self.arrived.notify_one();
    }

    async fn run_sync(&self, peer: &Address, target: u64) -> Result<(), ChainError> {
        let batch = self.config.batch_size.max(1);
        loop {
            let current = self.apply_pending()?;
            if current >= target || !self.is_syncing() {
                return Ok(());
            }
            let start = current + 1;
            let end = target.min(start.saturating_add(batch - 1));
            self.request_blocks(peer, start, end)?;
            self.await_batch(end).await?;
        }
    }

    /// Waits until the chain reaches `end`, applying blocks as they arrive.
    /// The deadline resets whenever a block is applied.
    async fn await_batch(&self, end: u64) -> Result<(), ChainError> {
        let timeout = self.config.response_timeout();
        let mut last_height = self.chain.height();
        let mut deadline = tokio::time::Instant::now() + timeout;
        loop {
            let current = self.apply_pending()?;
            if current >= end || !self.is_syncing() {
                return Ok(());
            }
            if current > last_height {
                last_height = current;
                deadline = tokio::time::Instant::now() + timeout;
            }
            if tokio::time::timeout_at(deadline, self.arrived.notified())
                .await
                .is_err()
            {
                return Err(ChainError::SyncFailure(format!(
                    "Timed out waiting for blocks {}..={}",
                    current + 1,
                    end
                )));
            }
        }
    }

    /// Applies pending blocks strictly in height order. Returns the chain
    /// height afterwards.
    fn apply_pending(&self) -> Result<u64, ChainError> {
        loop {
            let next = self.chain.height() + 1;
            let block = {
                let mut pending = self.pending.lock();
                // drop anything the chain already has, e.g. via gossip
                pending.retain(|height, _| *height >= next);
                pending.remove(&next)
            };
            let Some(block) = block else {
                return Ok(next - 1);
            };
            if let Err(e) = self.chain.apply_block(block) {
                // a concurrent writer may have appended the same height
                if self.chain.height() >= next {
                    continue;
                }
                return Err(ChainError::SyncFailure(format!(
                    "Block {} failed to apply: {}",
                    next, e
                )));
            }
            let mut state = self.state.lock();
            state.current_height = next;
            state.blocks_synced += 1;
        }
    }

    /// Sends a SYNC_REQ for the closed range `[start, end]` to `peer`.
    pub fn request_blocks(&self, peer: &Address, start: u64, end: u64) -> Result<(), ChainError> {
        debug!("Requesting blocks {}..={} from {}", start, end, peer);
        let message = Message::new(
            MessageType::SyncReq,
            &SyncRequest {
                start_height: start,
                end_height: end,
            },
            self.peers.node_address().clone(),
        )?;
        self.peers
            .send_to(peer, message)
            .map_err(|e| ChainError::SyncFailure(format!("Block request failed: {}", e)))
    }

    /// Answers with the stored blocks in the requested range, at most one
    /// batch of them.
    fn handle_sync_request(&self, message: Message, peer: PeerInfo) {
        let request: SyncRequest = match message.payload_as() {
            Ok(request) => request,
            Err(e) => {
                warn!("Bad sync request from {}: {}", peer.address, e);
                return;
            }
        };
        if request.start_height > request.end_height {
            warn!(
                "Empty sync range {}..={} from {}",
                request.start_height, request.end_height, peer.address
            );
            return;
        }
        let end = request
            .end_height
            .min(request.start_height.saturating_add(self.config.batch_size.max(1) - 1));
        let blocks = self.chain.blocks_in_range(request.start_height, end);
        debug!(
            "Serving {} blocks ({}..={}) to {}",
            blocks.len(),
            request.start_height,
            end,
            peer.address
        );

        let result = Message::new(
            MessageType::SyncRes,
            &SyncResponse { blocks },
            self.peers.node_address().clone(),
        )
        .and_then(|response| self.peers.send_to(&peer.address, response));
        if let Err(e) = result {
            warn!("Failed to answer sync request from {}: {}", peer.address, e);
        }
    }

    /// Accepts blocks only from the peer we are syncing with.
    fn handle_sync_response(&self, message: Message, peer: PeerInfo) {
        let target = {
            let state = self.state.lock();
            if !state.syncing || state.sync_peer.as_ref() != Some(&peer.address) {
                debug!("Ignoring unsolicited sync response from {}", peer.address);
                return;
            }
            state.target_height
        };
        let response: SyncResponse = match message.payload_as() {
            Ok(response) => response,
            Err(e) => {
                warn!("Bad sync response from {}: {}", peer.address, e);
                return;
            }
        };

        let local = self.chain.height();
        let received = response.blocks.len();
        {
            let mut pending = self.pending.lock();
            for block in response.blocks {
                let height = block.height();
                if height > local && height <= target {
                    pending.insert(height, block);
                }
            }
        }
        debug!("Received {} blocks from {}", received, peer.address);
        self.arrived.notify_one();
    }
}

/// What the node should do with a block announced by a peer.
#[derive(Debug, Clone, PartialEq)]
pub enum AnnouncementAction {
    /// Height is already in our chain
    AlreadyKnown,
    /// Announced block is more than one ahead; backfill first
    NeedSync { local_height: u64, announced_height: u64 },
    /// Block was the next height and has been appended
    Applied,
    /// Block was the next height but failed validation
    Rejected(ChainError),
}

/// Single-block propagation on top of gossip.
pub struct BlockAnnouncer {
    gossip: Arc<GossipProtocol>,
    chain: Arc<dyn ChainHandle>,
}

impl BlockAnnouncer {
    pub fn new(gossip: Arc<GossipProtocol>, chain: Arc<dyn ChainHandle>) -> Self {
        BlockAnnouncer { gossip, chain }
    }

    /// Announces a block this node produced or accepted.
    pub fn announce_block(&self, block: &Block) -> Result<usize, ChainError> {
        self.gossip.broadcast_block(block)
    }

    pub fn on_announcement(&self, block: Block) -> AnnouncementAction {
        let local_height = self.chain.height();
        let announced_height = block.height();
        if announced_height <= local_height {
            return AnnouncementAction::AlreadyKnown;
        }
        if announced_height > local_height + 1 {
            info!(
                "Missing blocks: local {}, announced {}",
                local_height, announced_height
            );
            return AnnouncementAction::NeedSync {
                local_height,
                announced_height,
            };
        }
        match self.chain.apply_block(block) {
            Ok(()) => AnnouncementAction::Applied,
            Err(_) if self.chain.height() >= announced_height => AnnouncementAction::AlreadyKnown,
            Err(e) => {
                warn!("Rejected announced block {}: {}", announced_height, e);
                AnnouncementAction::Rejected(e)
            }
        }
    }
}
