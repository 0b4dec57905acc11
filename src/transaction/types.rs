//! Transfer type and its identity hash

use crate::crypto::{hex_option, Address, KeyPair};
use crate::error::ChainError;
use sha2::{Digest, Sha256};

/// Upper bound on a transaction's encoded size, in bytes.
pub const MAX_TRANSACTION_SIZE: usize = 100_000;

/// Default fee in nouslings (0.00001 NOUS)
pub const DEFAULT_FEE: u64 = 1_000;

/// A value transfer between two accounts. Amounts are in nouslings.
///
/// The identity hash covers every field except the signature envelope
/// (`signature`, `public_key`), so a transaction keeps its id once signed.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Transaction {
    pub sender: Address,
    pub recipient: Address,
    pub amount: u64,
    pub fee: u64,
    pub nonce: u64,
    /// Unix timestamp in milliseconds
    pub timestamp: u64,
    #[serde(default, with = "hex_option", skip_serializing_if = "Option::is_none")]
    pub signature: Option<Vec<u8>>,
    #[serde(default, with = "hex_option", skip_serializing_if = "Option::is_none")]
    pub public_key: Option<Vec<u8>>,
}

impl Transaction {
    /// Argument order matches [`create_transaction`]: amount, nonce, fee.
    pub fn new(sender: Address, recipient: Address, amount: u64, nonce: u64, fee: u64) -> Self {
        Transaction {
            sender,
            recipient,
            amount,
            fee,
            nonce,
            timestamp: chrono::Utc::now().timestamp_millis() as u64,
            signature: None,
            public_key: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"NOUS_TX");
        for address in [&self.sender, &self.recipient] {
            let bytes = address.as_str().as_bytes();
            hasher.update((bytes.len() as u32).to_le_bytes());
            hasher.update(bytes);
        }
        hasher.update(self.amount.to_le_bytes());
        hasher.update(self.fee.to_le_bytes());
        hasher.update(self.nonce.to_le_bytes());
        hasher.update(self.timestamp.to_le_bytes());
        hasher.finalize().into()
    }

    /// Hex-encoded identity hash
    pub fn tx_id(&self) -> String {
        hex::encode(self.hash())
    }

    /// Total debit from the sender: amount plus fee.
    pub fn total_cost(&self) -> Result<u64, ChainError> {
        self.amount
            .checked_add(self.fee)
            .ok_or_else(|| ChainError::InvalidTransaction("Amount plus fee overflows".to_string()))
    }

    /// Signs the identity hash and attaches the signer's public key.
    pub fn sign(&mut self, keypair: &KeyPair) -> Result<(), ChainError> {
        let signature = keypair.sign(&self.hash())?;
        self.signature = Some(signature.to_vec());
        self.public_key = Some(keypair.public_key_bytes().to_vec());
        Ok(())
    }

    pub fn signed(mut self, keypair: &KeyPair) -> Result<Self, ChainError> {
        self.sign(keypair)?;
        Ok(self)
    }

    /// Rejects transactions whose bincode encoding exceeds
    /// [`MAX_TRANSACTION_SIZE`].
    pub fn validate_size(&self) -> Result<(), ChainError> {
        let encoded = bincode::serialized_size(self)?;
        match usize::try_from(encoded) {
            Ok(len) if len <= MAX_TRANSACTION_SIZE => Ok(()),
            _ => Err(ChainError::InvalidTransaction(format!(
                "Encoded size {} exceeds {} bytes",
                encoded, MAX_TRANSACTION_SIZE
            ))),
        }
    }
}

/// Create and sign a transfer from `sender_keypair` to `recipient`.
pub fn create_transaction(
    sender_keypair: &KeyPair,
    recipient: Address,
    amount: u64,
    nonce: u64,
    fee: u64,
) -> Result<Transaction, ChainError> {
    Transaction::new(sender_keypair.address(), recipient, amount, nonce, fee).signed(sender_keypair)
}
