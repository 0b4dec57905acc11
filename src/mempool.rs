//! Pending transaction pool with fee-priority selection

use crate::crypto::Address;
use crate::error::ChainError;
use crate::transaction::Transaction;
use std::collections::{HashMap, HashSet};

pub const DEFAULT_MEMPOOL_SIZE: usize = 5_000;

#[derive(Debug, Clone)]
struct MempoolEntry {
    tx: Transaction,
    /// Insertion sequence, the tie-break between equal fees
    sequence: u64,
}

/// Lightweight view of a pending transaction for query callers.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PendingSummary {
    pub tx_id: String,
    pub sender: Address,
    pub recipient: Address,
    pub amount: u64,
    pub fee: u64,
    pub nonce: u64,
}

/// Bounded pool keyed by transaction id with a secondary index by sender.
///
/// Admission only rejects duplicates, malformed transactions and overflow.
/// Balance and nonce are checked when a block is assembled, not here.
#[derive(Debug, Clone)]
pub struct Mempool {
    transactions: HashMap<String, MempoolEntry>,
    by_sender: HashMap<Address, HashSet<String>>,
    max_size: usize,
    next_sequence: u64,
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new()
    }
}

impl Mempool {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MEMPOOL_SIZE)
    }

    pub fn with_capacity(max_size: usize) -> Self {
        Mempool {
            transactions: HashMap::new(),
            by_sender: HashMap::new(),
            max_size,
            next_sequence: 0,
        }
    }

    /// Admits `tx` and returns its id.
    pub fn add(&mut self, tx: Transaction) -> Result<String, ChainError> {
        let tx_id = tx.tx_id();
        if self.transactions.contains_key(&tx_id) {
            return Err(ChainError::AlreadyPresent(tx_id));
        }
        tx.validate_size()?;
        tx.is_valid()?;
        if self.transactions.len() >= self.max_size {
            return Err(ChainError::MempoolFull);
        }

        self.by_sender
            .entry(tx.sender.clone())
            .or_default()
            .insert(tx_id.clone());
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.transactions
            .insert(tx_id.clone(), MempoolEntry { tx, sequence });
        Ok(tx_id)
    }

    /// Removes a transaction; absent ids are ignored.
    pub fn remove(&mut self, tx_id: &str) -> Option<Transaction> {
        let entry = self.transactions.remove(tx_id)?;
        if let Some(ids) = self.by_sender.get_mut(&entry.tx.sender) {
            ids.remove(tx_id);
            if ids.is_empty() {
                self.by_sender.remove(&entry.tx.sender);
            }
        }
        Some(entry.tx)
    }

    pub fn remove_batch<I, S>(&mut self, tx_ids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        tx_ids
            .into_iter()
            .filter(|id| self.remove(id.as_ref()).is_some())
            .count()
    }

    /// Up to `max_count` transactions by descending fee. Equal fees come
    /// out in insertion order.
    pub fn get_batch(&self, max_count: usize) -> Vec<Transaction> {
        let mut entries: Vec<&MempoolEntry> = self.transactions.values().collect();
        entries.sort_by(|a, b| b.tx.fee.cmp(&a.tx.fee).then(a.sequence.cmp(&b.sequence)));
        entries
            .into_iter()
            .take(max_count)
            .map(|e| e.tx.clone())
            .collect()
    }

    /// Pending transactions from `sender`, lowest nonce first.
    pub fn by_sender(&self, sender: &Address) -> Vec<Transaction> {
        let mut txs: Vec<Transaction> = self
            .by_sender
            .get(sender)
            .into_iter()
            .flatten()
            .filter_map(|id| self.transactions.get(id).map(|e| e.tx.clone()))
            .collect();
        txs.sort_by_key(|tx| tx.nonce);
        txs
    }

    pub fn contains(&self, tx_id: &str) -> bool {
        self.transactions.contains_key(tx_id)
    }

    pub fn get(&self, tx_id: &str) -> Option<&Transaction> {
        self.transactions.get(tx_id).map(|e| &e.tx)
    }

    pub fn summaries(&self, max_count: usize) -> Vec<PendingSummary> {
        self.get_batch(max_count)
            .into_iter()
            .map(|tx| PendingSummary {
                tx_id: tx.tx_id(),
                sender: tx.sender,
                recipient: tx.recipient,
                amount: tx.amount,
                fee: tx.fee,
                nonce: tx.nonce,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    pub fn clear(&mut self) {
        self.transactions.clear();
        self.by_sender.clear();
    }
}
