use crate::crypto::{hex_option, verify_signature, Address, KeyPair};
use crate::error::ChainError;
use crate::genesis::{Ratio, GENESIS_RULES};
use crate::transaction::Transaction;
use sha2::{Digest, Sha256};

pub type Sha256Hash = [u8; 32];

pub const ZERO_HASH: Sha256Hash = [0u8; 32];

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlockHeader {
    pub height: u64,
    #[serde(with = "hex::serde")]
    pub previous_hash: Sha256Hash,
    /// Unix timestamp in milliseconds
    pub timestamp: u64,
    pub proposer: Address,
    #[serde(with = "hex::serde")]
    pub transactions_root: Sha256Hash,
    /// Ledger commitment after this block is applied
    #[serde(with = "hex::serde")]
    pub state_root: Sha256Hash,
}

impl BlockHeader {
    pub fn hash(&self) -> Sha256Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.height.to_le_bytes());
        hasher.update(self.previous_hash);
        hasher.update(self.timestamp.to_le_bytes());
        let proposer = self.proposer.as_str().as_bytes();
        hasher.update((proposer.len() as u32).to_le_bytes());
        hasher.update(proposer);
        hasher.update(self.transactions_root);
        hasher.update(self.state_root);
        hasher.finalize().into()
    }
}

/// A validator's signed vote that a block is valid.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Attestation {
    pub validator: Address,
    #[serde(with = "hex::serde")]
    pub block_hash: Sha256Hash,
    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub public_key: Vec<u8>,
    pub timestamp: u64,
}

impl Attestation {
    pub fn create(keypair: &KeyPair, block_hash: Sha256Hash, timestamp: u64) -> Result<Self, ChainError> {
        Ok(Attestation {
            validator: keypair.address(),
            block_hash,
            signature: keypair.sign(&block_hash)?.to_vec(),
            public_key: keypair.public_key_bytes().to_vec(),
            timestamp,
        })
    }

    pub fn verify(&self) -> Result<(), ChainError> {
        if Address::from_public_key(&self.public_key) != self.validator {
            return Err(ChainError::InvalidAttestation(format!(
                "Public key does not belong to validator {}",
                self.validator
            )));
        }
        verify_signature(&self.public_key, &self.block_hash, &self.signature)
            .map_err(|e| ChainError::InvalidAttestation(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
    #[serde(default)]
    pub attestations: Vec<Attestation>,
    #[serde(default, with = "hex_option", skip_serializing_if = "Option::is_none")]
    pub proposer_signature: Option<Vec<u8>>,
    #[serde(default, with = "hex_option", skip_serializing_if = "Option::is_none")]
    pub proposer_public_key: Option<Vec<u8>>,
}

impl Block {
    pub fn new(
        height: u64,
        previous_hash: Sha256Hash,
        proposer: Address,
        transactions: Vec<Transaction>,
        state_root: Sha256Hash,
    ) -> Self {
        let transactions_root = Block::calculate_transactions_root(&transactions);
        Block {
            header: BlockHeader {
                height,
                previous_hash,
                timestamp: chrono::Utc::now().timestamp_millis() as u64,
                proposer,
                transactions_root,
                state_root,
            },
            transactions,
            attestations: Vec::new(),
            proposer_signature: None,
            proposer_public_key: None,
        }
    }

    /// The genesis block. Its timestamp is fixed by the genesis rules so
    /// every node derives the same genesis hash from the same bootstrap state.
    pub fn genesis(state_root: Sha256Hash) -> Self {
        Block {
            header: BlockHeader {
                height: 0,
                previous_hash: ZERO_HASH,
                timestamp: GENESIS_RULES.genesis_timestamp,
                proposer: Address::zero(),
                transactions_root: ZERO_HASH,
                state_root,
            },
            transactions: Vec::new(),
            attestations: Vec::new(),
            proposer_signature: None,
            proposer_public_key: None,
        }
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn hash(&self) -> Sha256Hash {
        self.header.hash()
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash())
    }

    /// Short human-readable identifier (first 16 hex chars of the hash).
    pub fn block_id(&self) -> String {
        self.hash_hex()[..16].to_string()
    }

    /// Flat hash over the ordered transaction hashes; all zeros when empty.
    /// Provides no inclusion proofs.
    pub fn calculate_transactions_root(transactions: &[Transaction]) -> Sha256Hash {
        if transactions.is_empty() {
            return ZERO_HASH;
        }
        let mut hasher = Sha256::new();
        for tx in transactions {
            hasher.update(tx.hash());
        }
        hasher.finalize().into()
    }

    pub fn total_fees(&self) -> u64 {
        self.transactions
            .iter()
            .fold(0u64, |acc, tx| acc.saturating_add(tx.fee))
    }

    pub fn sign(&mut self, keypair: &KeyPair) -> Result<(), ChainError> {
        self.proposer_signature = Some(keypair.sign(&self.hash())?.to_vec());
        self.proposer_public_key = Some(keypair.public_key_bytes().to_vec());
        Ok(())
    }

    /// Checks the proposer signature if one is attached.
    pub fn verify_proposer_signature(&self) -> Result<(), ChainError> {
        match (&self.proposer_signature, &self.proposer_public_key) {
            (None, None) => Ok(()),
            (Some(signature), Some(public_key)) => {
                if Address::from_public_key(public_key) != self.header.proposer {
                    return Err(ChainError::ConsensusViolation(
                        "Proposer public key does not match proposer address".to_string(),
                    ));
                }
                verify_signature(public_key, &self.hash(), signature).map_err(|e| {
                    ChainError::ConsensusViolation(format!("Bad proposer signature: {}", e))
                })
            }
            _ => Err(ChainError::ConsensusViolation(
                "Incomplete proposer signature".to_string(),
            )),
        }
    }

    /// Records a verified attestation. Returns false if this validator has
    /// already attested the block.
    pub fn add_attestation(&mut self, attestation: Attestation) -> Result<bool, ChainError> {
        if attestation.block_hash != self.hash() {
            return Err(ChainError::InvalidAttestation(
                "Attestation is for a different block".to_string(),
            ));
        }
        attestation.verify()?;
        if self
            .attestations
            .iter()
            .any(|a| a.validator == attestation.validator)
        {
            return Ok(false);
        }
        self.attestations.push(attestation);
        Ok(true)
    }

    pub fn attestation_ratio(&self, total_validators: usize) -> f64 {
        if total_validators == 0 {
            return 0.0;
        }
        self.attestations.len() as f64 / total_validators as f64
    }

    pub fn is_finalized(&self, total_validators: usize, threshold: Ratio) -> bool {
        threshold.is_met(self.attestations.len() as u64, total_validators as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::create_transaction;

    fn sample_block() -> Block {
        Block::new(1, [7u8; 32], KeyPair::generate().address(), vec![], [1u8; 32])
    }

    #[test]
    fn test_empty_block_has_zero_root() {
        assert_eq!(sample_block().header.transactions_root, ZERO_HASH);
    }

    #[test]
    fn test_transactions_root_depends_on_order() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate().address();
        let tx1 = create_transaction(&alice, bob.clone(), 1, 0, 0).unwrap();
        let tx2 = create_transaction(&alice, bob, 2, 1, 0).unwrap();
        let forward = Block::calculate_transactions_root(&[tx1.clone(), tx2.clone()]);
        let reversed = Block::calculate_transactions_root(&[tx2, tx1]);
        assert_ne!(forward, ZERO_HASH);
        assert_ne!(forward, reversed);
    }

    #[test]
    fn test_genesis_is_deterministic() {
        let a = Block::genesis([3u8; 32]);
        let b = Block::genesis([3u8; 32]);
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.header.previous_hash, ZERO_HASH);
        assert_eq!(a.height(), 0);
    }

    #[test]
    fn test_header_hash_covers_state_root() {
        let block = sample_block();
        let mut other = block.clone();
        other.header.state_root = [2u8; 32];
        assert_ne!(block.hash(), other.hash());
        assert_eq!(block.block_id().len(), 16);
    }

    #[test]
    fn test_proposer_signature() {
        let keypair = KeyPair::generate();
        let mut block = Block::new(1, ZERO_HASH, keypair.address(), vec![], ZERO_HASH);
        assert!(block.verify_proposer_signature().is_ok());
        block.sign(&keypair).unwrap();
        assert!(block.verify_proposer_signature().is_ok());

        block.header.proposer = KeyPair::generate().address();
        assert!(block.verify_proposer_signature().is_err());
    }

    #[test]
    fn test_attestations_and_finality() {
        let mut block = sample_block();
        let threshold = GENESIS_RULES.finality_threshold;
        let validators: Vec<KeyPair> = (0..3).map(|_| KeyPair::generate()).collect();

        let first = Attestation::create(&validators[0], block.hash(), 0).unwrap();
        assert!(block.add_attestation(first.clone()).unwrap());
        assert!(!block.add_attestation(first).unwrap());
        assert!(!block.is_finalized(3, threshold));

        let second = Attestation::create(&validators[1], block.hash(), 0).unwrap();
        assert!(block.add_attestation(second).unwrap());
        assert!(block.is_finalized(3, threshold));
        assert!((block.attestation_ratio(3) - 2.0 / 3.0).abs() < f64::EPSILON);
        assert!(!block.is_finalized(0, threshold));
    }

    #[test]
    fn test_attestation_for_other_block_rejected() {
        let mut block = sample_block();
        let keypair = KeyPair::generate();
        let wrong = Attestation::create(&keypair, [9u8; 32], 0).unwrap();
        assert!(block.add_attestation(wrong).is_err());

        let mut forged = Attestation::create(&keypair, block.hash(), 0).unwrap();
        forged.validator = KeyPair::generate().address();
        assert!(block.add_attestation(forged).is_err());
    }

    #[test]
    fn test_block_json_roundtrip_keeps_hash() {
        let keypair = KeyPair::generate();
        let tx = create_transaction(&keypair, KeyPair::generate().address(), 3, 0, 1).unwrap();
        let mut block = Block::new(4, [5u8; 32], keypair.address(), vec![tx], [6u8; 32]);
        block.sign(&keypair).unwrap();
        let json = serde_json::to_string(&block).unwrap();
        let decoded: Block = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.hash(), block.hash());
        assert_eq!(decoded, block);
    }
}
