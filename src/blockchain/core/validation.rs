use crate::blockchain::core::block::{Attestation, Block, ZERO_HASH};
use crate::blockchain::core::state::Ledger;
use crate::crypto::{Address, KeyPair};
use crate::error::ChainError;
use crate::genesis::GENESIS_RULES;
use crate::transaction::Transaction;

/// Checks a transaction against the current ledger without mutating it.
pub fn validate_transaction(ledger: &Ledger, tx: &Transaction) -> Result<(), ChainError> {
    tx.validate_size()?;
    ledger.check_transaction(tx)
}

/// Runs every consensus check on `block` against the state left by
/// `previous` and returns the resulting ledger. `ledger` itself is never
/// touched, so a rejected block has no effect.
///
/// Transactions are applied in block order on a scratch copy, each one
/// validated against the state its predecessors produced. Fees go to the
/// proposer, then the block reward is minted, capped to whatever supply
/// remains below the ceiling.
pub fn execute_block(
    block: &Block,
    previous: Option<&Block>,
    ledger: &Ledger,
    total_validators: usize,
) -> Result<Ledger, ChainError> {
    let expected_height = previous.map_or(0, |p| p.height() + 1);
    if block.height() != expected_height {
        return Err(ChainError::ConsensusViolation(format!(
            "Invalid height: expected {}, got {}",
            expected_height,
            block.height()
        )));
    }

    let expected_previous = previous.map_or(ZERO_HASH, |p| p.hash());
    if block.header.previous_hash != expected_previous {
        return Err(ChainError::ConsensusViolation(format!(
            "Invalid previous hash: expected {}, got {}",
            hex::encode(expected_previous),
            hex::encode(block.header.previous_hash)
        )));
    }

    if ledger.total_supply() > GENESIS_RULES.max_supply {
        return Err(ChainError::ConsensusViolation(
            "GENESIS VIOLATION: Max supply exceeded".to_string(),
        ));
    }

    let expected_root = Block::calculate_transactions_root(&block.transactions);
    if expected_root != block.header.transactions_root {
        return Err(ChainError::ConsensusViolation(format!(
            "Transactions root mismatch: expected {}, got {}",
            hex::encode(expected_root),
            hex::encode(block.header.transactions_root)
        )));
    }

    if block.attestations.len() > total_validators {
        return Err(ChainError::ConsensusViolation(format!(
            "Block carries {} attestations for {} validators",
            block.attestations.len(),
            total_validators
        )));
    }

    block.verify_proposer_signature()?;

    let proposer = &block.header.proposer;
    if block.height() > 0 && ledger.account(proposer).staked < GENESIS_RULES.min_stake {
        return Err(ChainError::ConsensusViolation(format!(
            "Proposer {} does not meet minimum stake",
            proposer
        )));
    }

    let mut scratch = ledger.clone();
    for tx in &block.transactions {
        tx.validate_size()
            .and_then(|_| scratch.apply_transaction(tx))
            .map_err(|e| {
                ChainError::ConsensusViolation(format!("Invalid transaction {}: {}", tx.tx_id(), e))
            })?;
    }

    if block.height() > 0 {
        let fees = block.total_fees();
        let producer_fees = GENESIS_RULES.fee_to_producer.apply(fees);
        scratch.credit_fees(proposer, producer_fees);
        scratch.burn(fees - producer_fees);

        let reward = GENESIS_RULES
            .block_reward(block.height())
            .min(scratch.remaining_supply());
        scratch.distribute_reward(proposer, reward, GENESIS_RULES.agent_share)?;
    }

    let state_root = scratch.state_root();
    if state_root != block.header.state_root {
        return Err(ChainError::ConsensusViolation(format!(
            "State root mismatch: expected {}, got {}",
            hex::encode(state_root),
            hex::encode(block.header.state_root)
        )));
    }

    Ok(scratch)
}

pub fn validate_block(
    block: &Block,
    previous: Option<&Block>,
    ledger: &Ledger,
    total_validators: usize,
) -> Result<(), ChainError> {
    execute_block(block, previous, ledger, total_validators).map(|_| ())
}

/// True once at least two thirds of the validator set has attested.
pub fn check_finality(block: &Block, total_validators: usize) -> bool {
    block.is_finalized(total_validators, GENESIS_RULES.finality_threshold)
}

/// A node's validating identity: checks blocks and signs attestations.
pub struct Validator {
    keypair: KeyPair,
}

impl Validator {
    pub fn new(keypair: KeyPair) -> Self {
        Validator { keypair }
    }

    pub fn address(&self) -> Address {
        self.keypair.address()
    }

    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    pub fn validate_transaction(&self, ledger: &Ledger, tx: &Transaction) -> Result<(), ChainError> {
        validate_transaction(ledger, tx)
    }

    pub fn validate_block(
        &self,
        block: &Block,
        previous: Option<&Block>,
        ledger: &Ledger,
        total_validators: usize,
    ) -> Result<(), ChainError> {
        validate_block(block, previous, ledger, total_validators)
    }

    /// Signs an attestation for `block` if it validates, otherwise `None`.
    pub fn attest(
        &self,
        block: &Block,
        previous: Option<&Block>,
        ledger: &Ledger,
        total_validators: usize,
    ) -> Option<Attestation> {
        if let Err(e) = validate_block(block, previous, ledger, total_validators) {
            tracing::debug!("Refusing to attest block {}: {}", block.block_id(), e);
            return None;
        }
        match self.sign_attestation(block) {
            Ok(attestation) => Some(attestation),
            Err(e) => {
                tracing::warn!("Failed to sign attestation for {}: {}", block.block_id(), e);
                None
            }
        }
    }

    /// Signs an attestation for a block that has already been applied.
    pub fn sign_attestation(&self, block: &Block) -> Result<Attestation, ChainError> {
        let timestamp = chrono::Utc::now().timestamp_millis() as u64;
        Attestation::create(&self.keypair, block.hash(), timestamp)
    }

    pub fn check_finality(&self, block: &Block, total_validators: usize) -> bool {
        check_finality(block, total_validators)
    }
}
