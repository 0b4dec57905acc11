use crate::blockchain::core::block::{Attestation, Block, Sha256Hash};
use crate::blockchain::core::state::{Account, Ledger};
use crate::blockchain::core::validation::{check_finality, execute_block, validate_transaction};
use crate::crypto::{Address, KeyPair};
use crate::error::ChainError;
use crate::genesis::{GenesisConfig, GENESIS_RULES};
use crate::transaction::Transaction;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;

/// Chain shared between the producer loop, gossip handlers and sync.
pub type SharedChain = Arc<RwLock<Blockchain>>;

/// Outcome of assembling a block from mempool candidates.
#[derive(Debug, Clone)]
pub struct AssembledBlock {
    pub block: Block,
    /// Candidates left out because they no longer apply, with the reason
    pub rejected: Vec<(String, ChainError)>,
}

/// Result of recording an attestation against a stored block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttestationOutcome {
    pub height: u64,
    pub added: bool,
    pub finalized: bool,
}

#[derive(Debug, Clone)]
pub struct Blockchain {
    blocks: Vec<Block>,
    ledger: Ledger,
    validators: Vec<Address>,
}

impl Blockchain {
    /// Bootstraps the ledger from `genesis` and commits the genesis block
    /// over the resulting state.
    pub fn new(genesis: &GenesisConfig) -> Result<Self, ChainError> {
        let ledger = Self::genesis_ledger(genesis)?;
        let genesis_block = Block::genesis(ledger.state_root());
        Ok(Blockchain {
            blocks: vec![genesis_block],
            ledger,
            validators: genesis.validator_addresses(),
        })
    }

    fn genesis_ledger(genesis: &GenesisConfig) -> Result<Ledger, ChainError> {
        let mut ledger = Ledger::new();
        for (address, amount) in &genesis.balances {
            ledger.mint(address, *amount)?;
        }
        for validator in &genesis.validators {
            ledger.stake(&validator.address, validator.stake)?;
            if let Some(owner) = &validator.owner {
                let account = ledger.get_account(&validator.address);
                account.is_agent = true;
                account.owner = Some(owner.clone());
            }
        }
        Ok(ledger)
    }

    pub fn height(&self) -> u64 {
        self.tip().height()
    }

    pub fn tip(&self) -> &Block {
        // the genesis block is pushed in `new` and blocks are never popped
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn block_at(&self, height: u64) -> Option<&Block> {
        self.blocks.get(usize::try_from(height).ok()?)
    }

    pub fn block_by_hash(&self, hash: &Sha256Hash) -> Option<&Block> {
        self.blocks.iter().rev().find(|b| &b.hash() == hash)
    }

    /// Blocks in `[start, end]`, clipped to what is stored.
    pub fn blocks_in_range(&self, start: u64, end: u64) -> Vec<Block> {
        (start..=end.min(self.height()))
            .filter_map(|h| self.block_at(h).cloned())
            .collect()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn account(&self, address: &Address) -> Account {
        self.ledger.account(address)
    }

    pub fn validators(&self) -> &[Address] {
        &self.validators
    }

    pub fn total_validators(&self) -> usize {
        self.validators.len()
    }

    pub fn is_validator(&self, address: &Address) -> bool {
        self.validators.contains(address)
    }

    /// Round-robin proposer for `height`.
    pub fn proposer_for(&self, height: u64) -> Option<&Address> {
        if self.validators.is_empty() {
            return None;
        }
        let index = (height % self.validators.len() as u64) as usize;
        self.validators.get(index)
    }

    pub fn validate_transaction(&self, tx: &Transaction) -> Result<(), ChainError> {
        validate_transaction(&self.ledger, tx)
    }

    /// Validates `block` as the next block and commits it. On error the
    /// chain and ledger are unchanged.
    pub fn apply_block(&mut self, block: Block) -> Result<(), ChainError> {
        self.check_carried_attestations(&block)?;
        let post_state = execute_block(
            &block,
            Some(self.tip()),
            &self.ledger,
            self.validators.len(),
        )?;
        self.ledger = post_state;
        self.blocks.push(block);
        Ok(())
    }

    /// Attestations shipped inside a block count toward finality, so each
    /// one must be signed by a distinct validator over this block's hash.
    fn check_carried_attestations(&self, block: &Block) -> Result<(), ChainError> {
        let hash = block.hash();
        let mut signers = HashSet::with_capacity(block.attestations.len());
        for attestation in &block.attestations {
            if attestation.block_hash != hash {
                return Err(ChainError::InvalidAttestation(format!(
                    "Carried attestation from {} names block {}",
                    attestation.validator,
                    hex::encode(attestation.block_hash)
                )));
            }
            if !self.is_validator(&attestation.validator) {
                return Err(ChainError::InvalidAttestation(format!(
                    "{} is not a validator",
                    attestation.validator
                )));
            }
            if !signers.insert(&attestation.validator) {
                return Err(ChainError::InvalidAttestation(format!(
                    "Duplicate attestation from {}",
                    attestation.validator
                )));
            }
            attestation.verify()?;
        }
        Ok(())
    }

    /// Builds and signs the next block from `candidates`, skipping any that
    /// no longer apply. The state root is computed on a scratch ledger so
    /// the committed state is untouched until `apply_block`.
    pub fn assemble_block(
        &self,
        proposer: &KeyPair,
        candidates: Vec<Transaction>,
    ) -> Result<AssembledBlock, ChainError> {
        let proposer_address = proposer.address();
        let height = self.height() + 1;
        let mut scratch = self.ledger.clone();
        let mut included = Vec::with_capacity(candidates.len());
        let mut rejected = Vec::new();

        for tx in candidates {
            match tx.validate_size().and_then(|_| scratch.apply_transaction(&tx)) {
                Ok(()) => included.push(tx),
                Err(e) => rejected.push((tx.tx_id(), e)),
            }
        }

        let fees = included.iter().fold(0u64, |acc, tx| acc.saturating_add(tx.fee));
        let producer_fees = GENESIS_RULES.fee_to_producer.apply(fees);
        scratch.credit_fees(&proposer_address, producer_fees);
        scratch.burn(fees - producer_fees);
        let reward = GENESIS_RULES
            .block_reward(height)
            .min(scratch.remaining_supply());
        scratch.distribute_reward(&proposer_address, reward, GENESIS_RULES.agent_share)?;

        let mut block = Block::new(
            height,
            self.tip().hash(),
            proposer_address,
            included,
            scratch.state_root(),
        );
        block.sign(proposer)?;
        Ok(AssembledBlock { block, rejected })
    }

    /// Attaches a verified attestation from a known validator to the block
    /// it names.
    pub fn add_attestation(&mut self, attestation: Attestation) -> Result<AttestationOutcome, ChainError> {
        if !self.is_validator(&attestation.validator) {
            return Err(ChainError::InvalidAttestation(format!(
                "{} is not a validator",
                attestation.validator
            )));
        }
        let total = self.validators.len();
        let block = self
            .blocks
            .iter_mut()
            .rev()
            .find(|b| b.hash() == attestation.block_hash)
            .ok_or_else(|| {
                ChainError::InvalidAttestation(format!(
                    "Unknown block {}",
                    hex::encode(attestation.block_hash)
                ))
            })?;
        let added = block.add_attestation(attestation)?;
        Ok(AttestationOutcome {
            height: block.height(),
            added,
            finalized: check_finality(block, total),
        })
    }

    /// Highest block that has gathered finality attestations, falling back
    /// to depth-based confirmation when nobody attests.
    pub fn finalized_height(&self) -> u64 {
        let total = self.validators.len();
        let by_attestation = self
            .blocks
            .iter()
            .rev()
            .find(|b| check_finality(b, total))
            .map_or(0, |b| b.height());
        let by_depth = self
            .height()
            .saturating_sub(GENESIS_RULES.finality_confirmations);
        by_attestation.max(by_depth)
    }

    pub fn state_root(&self) -> Sha256Hash {
        self.ledger.state_root()
    }
}
