//! Cryptographic identity for Nous nodes and wallets

use crate::error::ChainError;
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use secp256k1::{
    constants::{COMPACT_SIGNATURE_SIZE, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE},
    ecdsa::Signature,
    All, Message, PublicKey, Secp256k1, SecretKey,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

static SECP: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

fn sighash(payload: &[u8]) -> Result<Message, ChainError> {
    Message::from_digest_slice(&Sha256::digest(payload))
        .map_err(|e| ChainError::CryptoError(format!("Cannot build sighash: {}", e)))
}

pub const ADDRESS_PREFIX: &str = "nous:";
/// Number of public-key-hash bytes kept in an address.
pub const ADDRESS_HASH_LEN: usize = 20;

/// Account address: `nous:` followed by the hex of the last 20 bytes of
/// SHA-256(compressed public key).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    /// Derives the address owned by a compressed public key.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let digest = Sha256::digest(public_key);
        Address(format!(
            "{}{}",
            ADDRESS_PREFIX,
            hex::encode(&digest[digest.len() - ADDRESS_HASH_LEN..])
        ))
    }

    /// The all-zero address, used as the genesis block proposer.
    pub fn zero() -> Self {
        Address(format!("{}{}", ADDRESS_PREFIX, "0".repeat(ADDRESS_HASH_LEN * 2)))
    }

    /// Wraps a string without checking it. Structural validation rejects
    /// malformed addresses later, which is what inbound wire data needs.
    pub fn new_unchecked(s: impl Into<String>) -> Self {
        Address(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_well_formed(&self) -> bool {
        match self.0.strip_prefix(ADDRESS_PREFIX) {
            Some(body) => {
                body.len() == ADDRESS_HASH_LEN * 2
                    && body.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
            }
            None => false,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let address = Address(s.to_ascii_lowercase());
        if !address.is_well_formed() {
            return Err(ChainError::CryptoError(format!("Invalid address format: {}", s)));
        }
        Ok(address)
    }
}

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from_secret_key(SecretKey::new(&mut OsRng))
    }

    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        KeyPair {
            public_key: PublicKey::from_secret_key(&SECP, &secret_key),
            secret_key,
        }
    }

    /// Restores an identity from the 32 raw secret bytes (as printed by
    /// `--keygen`, hex-decoded).
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, ChainError> {
        if bytes.len() != SECRET_KEY_SIZE {
            return Err(ChainError::CryptoError(format!(
                "Secret key length {} != {}",
                bytes.len(),
                SECRET_KEY_SIZE
            )));
        }
        SecretKey::from_slice(bytes)
            .map(Self::from_secret_key)
            .map_err(|e| ChainError::CryptoError(format!("Secret key out of range: {}", e)))
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret_key.secret_bytes())
    }

    pub fn address(&self) -> Address {
        Address::from_public_key(&self.public_key_bytes())
    }

    /// SEC1 compressed form, 33 bytes.
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public_key.serialize()
    }

    /// Signs SHA-256(message) and returns the compact signature bytes.
    pub fn sign(&self, message: &[u8]) -> Result<[u8; COMPACT_SIGNATURE_SIZE], ChainError> {
        let digest = sighash(message)?;
        Ok(SECP.sign_ecdsa(&digest, &self.secret_key).serialize_compact())
    }
}

/// Checks a compact signature over SHA-256(`message`) against a compressed
/// public key. Length mismatches are reported before any curve work.
pub fn verify_signature(
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), ChainError> {
    let bad = |what: String| Err(ChainError::CryptoError(what));
    if public_key.len() != PUBLIC_KEY_SIZE {
        return bad(format!("Public key length {} != {}", public_key.len(), PUBLIC_KEY_SIZE));
    }
    if signature.len() != COMPACT_SIGNATURE_SIZE {
        return bad(format!(
            "Signature length {} != {}",
            signature.len(),
            COMPACT_SIGNATURE_SIZE
        ));
    }

    let key = PublicKey::from_slice(public_key)
        .map_err(|e| ChainError::CryptoError(format!("Malformed public key: {}", e)))?;
    let sig = Signature::from_compact(signature)
        .map_err(|e| ChainError::CryptoError(format!("Malformed signature: {}", e)))?;

    SECP.verify_ecdsa(&sighash(message)?, &sig, &key)
        .map_err(|_| ChainError::CryptoError("Bad signature".to_string()))
}

/// Serde adapter storing `Option<Vec<u8>>` as an optional hex string.
pub mod hex_option {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_some(&hex::encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        raw.map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
