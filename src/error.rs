//! Error types for the Nous node

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),
    #[error("Invalid nonce: expected {expected}, got {got}")]
    InvalidNonce { expected: u64, got: u64 },
    #[error("Insufficient balance: need {needed}, have {available}")]
    InsufficientBalance { needed: u64, available: u64 },
    #[error("Insufficient staked balance: need {needed}, have {available}")]
    InsufficientStake { needed: u64, available: u64 },
    #[error("Would exceed max supply: requested {requested}, remaining {remaining}")]
    SupplyExceeded { requested: u64, remaining: u64 },
    #[error("Consensus violation: {0}")]
    ConsensusViolation(String),
    #[error("Invalid attestation: {0}")]
    InvalidAttestation(String),
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Sync failure: {0}")]
    SyncFailure(String),
    #[error("Mempool is full")]
    MempoolFull,
    #[error("Transaction already in mempool: {0}")]
    AlreadyPresent(String),
    #[error("Cryptographic error: {0}")]
    CryptoError(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Coarse classification used for logging and peer penalties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Supply,
    Consensus,
    Network,
    Sync,
    Internal,
}

impl ChainError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChainError::InvalidTransaction(_)
            | ChainError::InvalidNonce { .. }
            | ChainError::InsufficientBalance { .. }
            | ChainError::InsufficientStake { .. }
            | ChainError::InvalidAttestation(_)
            | ChainError::MempoolFull
            | ChainError::AlreadyPresent(_)
            | ChainError::CryptoError(_) => ErrorKind::Validation,
            ChainError::SupplyExceeded { .. } => ErrorKind::Supply,
            ChainError::ConsensusViolation(_) => ErrorKind::Consensus,
            ChainError::NetworkError(_) => ErrorKind::Network,
            ChainError::SyncFailure(_) => ErrorKind::Sync,
            ChainError::Serialization(_) | ChainError::IoError(_) | ChainError::Config(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub fn is_validation(&self) -> bool {
        self.kind() == ErrorKind::Validation
    }
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(err: serde_json::Error) -> Self {
        ChainError::Serialization(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for ChainError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        ChainError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for ChainError {
    fn from(err: toml::de::Error) -> Self {
        ChainError::Config(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;
