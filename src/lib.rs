//! Nous - a minimal proof-of-stake ledger node
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Consensus Core
//! - [`genesis`] - Immutable rule set, reward schedule and bootstrap data
//! - [`blockchain`] - Blocks, ledger state, validation and the chain
//! - [`transaction`] - Transfer transactions and structural checks
//! - [`mempool`] - Fee-priority pending transaction pool
//!
//! ## Cryptography
//! - [`crypto`] - secp256k1 keys, addresses and signatures
//!
//! ## Networking
//! - [`network`] - Wire messages and the peer manager
//! - [`gossip`] - Deduplicated flood propagation
//! - [`sync`] - Chain synchronization and block announcements
//! - [`cache`] - TTL-bounded seen-message cache
//!
//! ## Node
//! - [`node`] - Orchestrator and block production
//! - [`config`] - Configuration management
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Consensus Core
// ============================================================================
pub mod blockchain;
pub mod genesis;
pub mod mempool;
pub mod transaction;

// ============================================================================
// Cryptography
// ============================================================================
pub mod crypto;

// ============================================================================
// Networking
// ============================================================================
pub mod cache;
pub mod gossip;
pub mod network;
pub mod sync;

// ============================================================================
// Node & Configuration
// ============================================================================
pub mod config;
pub mod error;
pub mod node;
