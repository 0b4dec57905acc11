//! Node orchestration: wires ledger, mempool, gossip and sync together and
//! runs the block production loop.

use crate::blockchain::{Account, Attestation, Block, Blockchain, SharedChain, Validator};
use crate::config::Config;
use crate::crypto::{Address, KeyPair};
use crate::error::{ChainError, ErrorKind};
use crate::genesis::GenesisConfig;
use crate::gossip::{GossipProtocol, Propagation};
use crate::mempool::{Mempool, PendingSummary};
use crate::network::{PeerInfo, PeerManager};
use crate::sync::{AnnouncementAction, BlockAnnouncer, ChainHandle, ChainSync};
use crate::transaction::Transaction;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Reputation lost by a peer for relaying a block we reject.
pub const INVALID_BLOCK_PENALTY: i32 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeState {
    Booting,
    Syncing,
    Ready,
    Stopped,
}

/// Snapshot served to status queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStats {
    pub address: Address,
    pub owner: Option<Address>,
    pub state: NodeState,
    pub height: u64,
    pub finalized_height: u64,
    pub peers: usize,
    pub pending_txs: usize,
    pub validators: usize,
    pub total_supply: u64,
    pub agent_balance: u64,
    pub agent_staked: u64,
    pub owner_balance: Option<u64>,
    pub syncing: bool,
    pub sync_progress: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidatorInfo {
    pub address: Address,
    pub staked: u64,
    pub balance: u64,
    pub reputation: i64,
    pub is_agent: bool,
    pub owner: Option<Address>,
}

/// Block application as the node sees it: the chain lock is taken only
/// for the append, then included transactions leave the mempool and the
/// height advertised to peers moves forward.
struct NodeChain {
    chain: SharedChain,
    mempool: Arc<Mutex<Mempool>>,
    peers: Arc<PeerManager>,
}

impl ChainHandle for NodeChain {
    fn height(&self) -> u64 {
        self.chain.read().height()
    }

    fn blocks_in_range(&self, start: u64, end: u64) -> Vec<Block> {
        self.chain.read().blocks_in_range(start, end)
    }

    fn apply_block(&self, block: Block) -> Result<(), ChainError> {
        let tx_ids: Vec<String> = block.transactions.iter().map(|tx| tx.tx_id()).collect();
        let height = {
            let mut chain = self.chain.write();
            chain.apply_block(block)?;
            chain.height()
        };
        self.mempool.lock().remove_batch(&tx_ids);
        self.peers.set_local_height(height);
        Ok(())
    }
}

pub struct Node {
    config: Config,
    validator: Validator,
    chain: SharedChain,
    mempool: Arc<Mutex<Mempool>>,
    peers: Arc<PeerManager>,
    gossip: Arc<GossipProtocol>,
    sync: Arc<ChainSync>,
    announcer: BlockAnnouncer,
    handle: Arc<dyn ChainHandle>,
    state: RwLock<NodeState>,
    shutdown: watch::Sender<bool>,
}

impl Node {
    /// Builds a node from `config` with `keypair` as its validating
    /// identity. An empty genesis section bootstraps a single-validator
    /// chain owned by this node.
    pub fn new(config: Config, keypair: KeyPair) -> Result<Arc<Self>, ChainError> {
        config.validate()?;
        let address = keypair.address();
        let genesis = if config.genesis.validators.is_empty() {
            info!("No genesis validators configured, bootstrapping single-validator chain");
            GenesisConfig::single_validator(address.clone(), config.producer.owner_address.clone())
        } else {
            config.genesis.clone()
        };

        let blockchain = Blockchain::new(&genesis)?;
        info!(
            "Genesis block {} with {} validators",
            blockchain.tip().block_id(),
            blockchain.total_validators()
        );
        let chain: SharedChain = Arc::new(RwLock::new(blockchain));
        let mempool = Arc::new(Mutex::new(Mempool::with_capacity(config.mempool.max_size)));

        let peers = PeerManager::new(address, config.network.clone());
        peers.set_local_height(chain.read().height());
        let gossip = GossipProtocol::new(Arc::clone(&peers), config.gossip.clone());
        let handle: Arc<dyn ChainHandle> = Arc::new(NodeChain {
            chain: Arc::clone(&chain),
            mempool: Arc::clone(&mempool),
            peers: Arc::clone(&peers),
        });
        let sync = ChainSync::new(Arc::clone(&peers), Arc::clone(&handle), config.sync.clone());
        let announcer = BlockAnnouncer::new(Arc::clone(&gossip), Arc::clone(&handle));
        let (shutdown, _) = watch::channel(false);

        let node = Arc::new(Node {
            config,
            validator: Validator::new(keypair),
            chain,
            mempool,
            peers,
            gossip,
            sync,
            announcer,
            handle,
            state: RwLock::new(NodeState::Booting),
            shutdown,
        });
        node.register_callbacks();
        Ok(node)
    }

    fn register_callbacks(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.gossip.on_transaction(move |tx, peer| match weak.upgrade() {
            Some(node) => node.on_gossip_transaction(tx, peer),
            None => Propagation::Drop,
        });
        let weak = Arc::downgrade(self);
        self.gossip.on_block(move |block, peer| match weak.upgrade() {
            Some(node) => node.on_gossip_block(block, peer),
            None => Propagation::Drop,
        });
        let weak = Arc::downgrade(self);
        self.gossip.on_attestation(move |attestation, peer| match weak.upgrade() {
            Some(node) => node.on_gossip_attestation(attestation, peer),
            None => Propagation::Drop,
        });
    }

    pub fn address(&self) -> Address {
        self.validator.address()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn chain(&self) -> &SharedChain {
        &self.chain
    }

    pub fn peers(&self) -> &Arc<PeerManager> {
        &self.peers
    }

    pub fn gossip(&self) -> &Arc<GossipProtocol> {
        &self.gossip
    }

    pub fn sync(&self) -> &Arc<ChainSync> {
        &self.sync
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    fn set_state(&self, state: NodeState) {
        *self.state.write() = state;
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), NodeState::Syncing | NodeState::Ready)
    }

    /// Starts networking, catches up with peers and, when enabled, the
    /// production loop. Returns the bound peer address.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, ChainError> {
        info!(
            "Starting Nous node {} (network_id = {:#x})",
            self.address(),
            self.config.network.network_id
        );
        self.shutdown.send_replace(false);
        let local = self.peers.start().await?;

        self.set_state(NodeState::Syncing);
        if let Err(e) = self.sync.start_sync().await {
            warn!("Initial sync failed: {}", e);
        }
        self.set_state(NodeState::Ready);

        tokio::spawn(Arc::clone(self).sync_loop());
        if self.config.producer.enabled {
            tokio::spawn(Arc::clone(self).production_loop());
        }
        info!("Node ready at height {}", self.height());
        Ok(local)
    }

    pub fn stop(&self) {
        self.set_state(NodeState::Stopped);
        self.shutdown.send_replace(true);
        self.sync.cancel();
        self.peers.stop();
        info!("Node stopped at height {}", self.height());
    }

    /// Re-checks peer heights every maintenance interval and syncs when a
    /// peer has pulled ahead.
    async fn sync_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.network.maintenance_interval());
        ticker.tick().await;
        while self.is_running() {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.sync.start_sync().await {
                warn!("Sync failed: {}", e);
            }
        }
        debug!("Sync loop stopped");
    }

    fn spawn_sync(self: &Arc<Self>) {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = node.sync.start_sync().await {
                warn!("Sync failed: {}", e);
            }
        });
    }

    /// Sleeps one block interval per slot and produces when the next
    /// height's rotation slot belongs to this node.
    async fn production_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.producer.block_interval());
        ticker.tick().await;
        info!(
            "Block production enabled, interval {:?}",
            self.config.producer.block_interval()
        );
        while self.is_running() {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            if self.sync.is_syncing() {
                debug!("Skipping slot while syncing");
                continue;
            }
            match self.produce_block() {
                Ok(Some(block)) => info!(
                    "Produced block {} with {} transactions",
                    block.height(),
                    block.transactions.len()
                ),
                Ok(None) => {}
                Err(e) => error!("Block production failed: {}", e),
            }
        }
        debug!("Production loop stopped");
    }

    /// True if this node proposes the block at `height`.
    pub fn is_our_slot(&self, height: u64) -> bool {
        self.chain.read().proposer_for(height) == Some(&self.address())
    }

    /// Assembles, applies and announces the next block if this node is its
    /// proposer. Returns `None` when it is another validator's slot.
    pub fn produce_block(&self) -> Result<Option<Block>, ChainError> {
        let height = self.height() + 1;
        if !self.is_our_slot(height) {
            debug!("Slot {} belongs to another validator", height);
            return Ok(None);
        }

        let candidates = self
            .mempool
            .lock()
            .get_batch(self.config.producer.max_block_transactions);
        let assembled = self
            .chain
            .read()
            .assemble_block(self.validator.keypair(), candidates)?;

        let stale: Vec<String> = assembled
            .rejected
            .iter()
            .filter(|(_, e)| is_permanently_invalid(e))
            .map(|(id, _)| id.clone())
            .collect();
        for (id, e) in &assembled.rejected {
            debug!("Left {} out of block {}: {}", id, height, e);
        }
        self.mempool.lock().remove_batch(&stale);

        let block = assembled.block;
        self.handle.apply_block(block.clone())?;
        if let Err(e) = self.announcer.announce_block(&block) {
            warn!("Failed to announce block {}: {}", block.height(), e);
        }
        self.attest(&block);
        Ok(Some(block))
    }

    /// Signs, records and gossips our attestation for an accepted block.
    fn attest(&self, block: &Block) {
        if !self.chain.read().is_validator(&self.address()) {
            return;
        }
        let attestation = match self.validator.sign_attestation(block) {
            Ok(attestation) => attestation,
            Err(e) => {
                warn!("Failed to sign attestation for {}: {}", block.block_id(), e);
                return;
            }
        };
        if let Err(e) = self.chain.write().add_attestation(attestation.clone()) {
            warn!("Failed to record own attestation: {}", e);
            return;
        }
        if let Err(e) = self.gossip.broadcast_attestation(&attestation) {
            warn!("Failed to broadcast attestation: {}", e);
        }
    }

    /// Mempool admission: structure and signature, then the sender's
    /// current nonce and spendable balance. Nonces ahead of the ledger are
    /// admitted so a sender can queue several transactions.
    fn admit_transaction(&self, tx: Transaction) -> Result<String, ChainError> {
        tx.validate_size()?;
        tx.is_valid()?;
        let account = self.chain.read().account(&tx.sender);
        if tx.nonce < account.nonce {
            return Err(ChainError::InvalidNonce {
                expected: account.nonce,
                got: tx.nonce,
            });
        }
        let needed = tx.total_cost()?;
        let available = account.available_balance();
        if available < needed {
            return Err(ChainError::InsufficientBalance { needed, available });
        }
        self.mempool.lock().add(tx)
    }

    /// Admits a locally submitted transaction and gossips it. Returns the
    /// transaction id.
    pub fn submit_transaction(&self, tx: Transaction) -> Result<String, ChainError> {
        let tx_id = self.admit_transaction(tx.clone())?;
        info!("Accepted transaction {}", tx_id);
        if let Err(e) = self.gossip.broadcast_transaction(&tx) {
            warn!("Failed to broadcast transaction {}: {}", tx_id, e);
        }
        Ok(tx_id)
    }

    fn on_gossip_transaction(&self, tx: Transaction, peer: &PeerInfo) -> Propagation {
        match self.admit_transaction(tx) {
            Ok(tx_id) => {
                debug!("Admitted transaction {} from {}", tx_id, peer.address);
                Propagation::Forward
            }
            Err(e) => {
                debug!("Rejected transaction from {}: {}", peer.address, e);
                Propagation::Drop
            }
        }
    }

    fn on_gossip_block(self: &Arc<Self>, block: Block, peer: &PeerInfo) -> Propagation {
        if block.height() > peer.height {
            self.peers.update_peer_height(&peer.address, block.height());
        }
        match self.announcer.on_announcement(block.clone()) {
            AnnouncementAction::Applied => {
                info!("Applied block {} from {}", block.height(), peer.address);
                self.attest(&block);
                Propagation::Forward
            }
            AnnouncementAction::AlreadyKnown => Propagation::Drop,
            AnnouncementAction::NeedSync { .. } => {
                self.spawn_sync();
                Propagation::Drop
            }
            AnnouncementAction::Rejected(e) => {
                if let Some(reputation) = self.peers.penalize(&peer.address, INVALID_BLOCK_PENALTY) {
                    warn!(
                        "Peer {} relayed invalid block ({}), reputation now {}",
                        peer.address, e, reputation
                    );
                }
                Propagation::Drop
            }
        }
    }

    fn on_gossip_attestation(&self, attestation: Attestation, peer: &PeerInfo) -> Propagation {
        let validator = attestation.validator.clone();
        match self.chain.write().add_attestation(attestation) {
            Ok(outcome) if outcome.added => {
                if outcome.finalized {
                    debug!("Block {} finalized", outcome.height);
                }
                Propagation::Forward
            }
            Ok(_) => Propagation::Drop,
            Err(e) => {
                debug!("Ignored attestation by {} from {}: {}", validator, peer.address, e);
                Propagation::Drop
            }
        }
    }

    pub fn height(&self) -> u64 {
        self.chain.read().height()
    }

    pub fn account(&self, address: &Address) -> Account {
        self.chain.read().account(address)
    }

    pub fn balance(&self, address: &Address) -> u64 {
        self.chain.read().ledger().get_balance(address)
    }

    pub fn block_by_height(&self, height: u64) -> Option<Block> {
        self.chain.read().block_at(height).cloned()
    }

    /// Looks a transaction up in the mempool, then in the chain.
    pub fn transaction(&self, tx_id: &str) -> Option<Transaction> {
        if let Some(tx) = self.mempool.lock().get(tx_id) {
            return Some(tx.clone());
        }
        let chain = self.chain.read();
        (0..=chain.height()).rev().find_map(|height| {
            chain
                .block_at(height)?
                .transactions
                .iter()
                .find(|tx| tx.tx_id() == tx_id)
                .cloned()
        })
    }

    pub fn validators(&self) -> Vec<ValidatorInfo> {
        let chain = self.chain.read();
        chain
            .validators()
            .iter()
            .map(|address| {
                let account = chain.account(address);
                ValidatorInfo {
                    address: account.address,
                    staked: account.staked,
                    balance: account.balance,
                    reputation: account.reputation,
                    is_agent: account.is_agent,
                    owner: account.owner,
                }
            })
            .collect()
    }

    pub fn pending_transactions(&self, max_count: usize) -> Vec<PendingSummary> {
        self.mempool.lock().summaries(max_count)
    }

    pub fn stats(&self) -> NodeStats {
        let address = self.address();
        let (height, finalized_height, validators, total_supply, agent, owner_balance) = {
            let chain = self.chain.read();
            let agent = chain.account(&address);
            let owner_balance = agent
                .owner
                .as_ref()
                .map(|owner| chain.ledger().get_balance(owner));
            (
                chain.height(),
                chain.finalized_height(),
                chain.total_validators(),
                chain.ledger().total_supply(),
                agent,
                owner_balance,
            )
        };
        let sync = self.sync.state();
        NodeStats {
            address,
            owner: agent.owner,
            state: self.state(),
            height,
            finalized_height,
            peers: self.peers.peer_count(),
            pending_txs: self.mempool.lock().len(),
            validators,
            total_supply,
            agent_balance: agent.balance,
            agent_staked: agent.staked,
            owner_balance,
            syncing: sync.syncing,
            sync_progress: sync.progress(),
        }
    }
}

/// Errors that no later ledger state can fix.
fn is_permanently_invalid(error: &ChainError) -> bool {
    match error {
        ChainError::InvalidNonce { expected, got } => got < expected,
        ChainError::InsufficientBalance { .. } => false,
        e => e.kind() == ErrorKind::Validation,
    }
}

/// Installs the global fmt subscriber. Call once, from the binary.
pub fn init_tracing() {
    tracing_subscriber::fmt::init();
}
