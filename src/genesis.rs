//! Genesis rules: the immutable parameter table every node enforces.
//!
//! Nothing in here is read from configuration. A block or transaction that
//! violates one of these rules is rejected unconditionally.

use crate::crypto::Address;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// 1 NOUS = 10^8 nouslings
pub const NOUS: u64 = 100_000_000;

/// Exact integer fraction, so consensus arithmetic never touches floats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ratio {
    pub numerator: u64,
    pub denominator: u64,
}

impl Ratio {
    pub const fn new(numerator: u64, denominator: u64) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// `floor(amount * self)`, computed without overflow.
    pub fn apply(&self, amount: u64) -> u64 {
        if self.denominator == 0 {
            return 0;
        }
        ((amount as u128 * self.numerator as u128) / self.denominator as u128) as u64
    }

    /// True iff `part / whole >= self`. An empty whole never meets a ratio.
    pub fn is_met(&self, part: u64, whole: u64) -> bool {
        whole > 0 && part as u128 * self.denominator as u128 >= whole as u128 * self.numerator as u128
    }

    pub fn as_f64(&self) -> f64 {
        self.numerator as f64 / self.denominator as f64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenesisRules {
    // supply
    pub max_supply: u64,
    pub initial_reward: u64,
    pub halving_interval: u64,
    // consensus
    pub min_stake: u64,
    pub finality_confirmations: u64,
    pub finality_threshold: Ratio,
    pub governance_threshold: Ratio,
    // rewards
    pub owner_share: Ratio,
    pub agent_share: Ratio,
    pub fee_to_producer: Ratio,
    // slashing
    pub slash_genesis_violation: Ratio,
    pub slash_minor_infraction: Ratio,
    // identity
    pub network_id: u32,
    pub genesis_timestamp: u64,
    pub genesis_message: &'static str,
}

pub const GENESIS_RULES: GenesisRules = GenesisRules {
    max_supply: 21_000_000 * NOUS,
    initial_reward: 50 * NOUS,
    halving_interval: 210_000,
    min_stake: NOUS,
    finality_confirmations: 6,
    finality_threshold: Ratio::new(2, 3),
    governance_threshold: Ratio::new(9, 10),
    owner_share: Ratio::new(9, 10),
    agent_share: Ratio::new(1, 10),
    fee_to_producer: Ratio::new(1, 1),
    slash_genesis_violation: Ratio::new(1, 1),
    slash_minor_infraction: Ratio::new(1, 10),
    network_id: 0x4E4F_5553,
    // 2026-02-01T22:12:51Z
    genesis_timestamp: 1_769_983_971_000,
    genesis_message: "Feb 2026 - The first currency mined by AI, owned by humans",
};

impl GenesisRules {
    /// Content hash identifying this exact rule set. Two nodes whose hashes
    /// differ are running different chains.
    pub fn content_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.max_supply.to_le_bytes());
        hasher.update(self.initial_reward.to_le_bytes());
        hasher.update(self.halving_interval.to_le_bytes());
        hasher.update(self.min_stake.to_le_bytes());
        hasher.update(self.finality_confirmations.to_le_bytes());
        for ratio in [
            self.finality_threshold,
            self.governance_threshold,
            self.owner_share,
            self.agent_share,
            self.fee_to_producer,
            self.slash_genesis_violation,
            self.slash_minor_infraction,
        ] {
            hasher.update(ratio.numerator.to_le_bytes());
            hasher.update(ratio.denominator.to_le_bytes());
        }
        hasher.update(self.network_id.to_le_bytes());
        hasher.update(self.genesis_timestamp.to_le_bytes());
        hasher.update(self.genesis_message.as_bytes());
        hasher.finalize().into()
    }

    pub fn content_hash_hex(&self) -> String {
        hex::encode(self.content_hash())
    }

    /// Block reward at `height`: the initial reward halved once per
    /// completed halving interval, reaching zero and staying there.
    pub fn block_reward(&self, height: u64) -> u64 {
        let halvings = height / self.halving_interval;
        if halvings >= u64::BITS as u64 {
            0
        } else {
            self.initial_reward >> halvings
        }
    }
}

pub fn get_block_reward(height: u64) -> u64 {
    GENESIS_RULES.block_reward(height)
}

/// A validator present at genesis. `stake` is locked out of its balance;
/// an `owner` marks the validator as an agent whose rewards are split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisValidator {
    pub address: Address,
    #[serde(default = "default_genesis_stake")]
    pub stake: u64,
    #[serde(default)]
    pub owner: Option<Address>,
}

fn default_genesis_stake() -> u64 {
    GENESIS_RULES.min_stake
}

/// Bootstrap data every node of a network must agree on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisConfig {
    #[serde(default)]
    pub validators: Vec<GenesisValidator>,
    #[serde(default)]
    pub balances: BTreeMap<Address, u64>,
}

impl GenesisConfig {
    pub fn validator_addresses(&self) -> Vec<Address> {
        self.validators.iter().map(|v| v.address.clone()).collect()
    }

    /// Single-validator genesis funding the validator with exactly its stake.
    pub fn single_validator(address: Address, owner: Option<Address>) -> Self {
        let mut balances = BTreeMap::new();
        balances.insert(address.clone(), GENESIS_RULES.min_stake);
        Self {
            validators: vec![GenesisValidator {
                address,
                stake: GENESIS_RULES.min_stake,
                owner,
            }],
            balances,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reward_halving_schedule() {
        let interval = GENESIS_RULES.halving_interval;
        assert_eq!(get_block_reward(0), 50 * NOUS);
        assert_eq!(get_block_reward(interval - 1), 50 * NOUS);
        assert_eq!(get_block_reward(interval), 25 * NOUS);
        assert_eq!(get_block_reward(2 * interval - 1), 25 * NOUS);
        assert_eq!(get_block_reward(2 * interval), 1_250_000_000);
    }

    #[test]
    fn test_reward_reaches_zero_and_stays() {
        let interval = GENESIS_RULES.halving_interval;
        // 50 * 10^8 < 2^33, so 33 halvings exhaust it
        assert_eq!(get_block_reward(33 * interval), 0);
        assert_eq!(get_block_reward(64 * interval), 0);
        assert_eq!(get_block_reward(u64::MAX), 0);
        assert!(get_block_reward(32 * interval) > 0);
    }

    #[test]
    fn test_ratio_threshold() {
        let two_thirds = GENESIS_RULES.finality_threshold;
        assert!(two_thirds.is_met(2, 3));
        assert!(two_thirds.is_met(3, 3));
        assert!(!two_thirds.is_met(1, 3));
        assert!(!two_thirds.is_met(6, 10));
        assert!(two_thirds.is_met(7, 10));
        assert!(!two_thirds.is_met(0, 0));
    }

    #[test]
    fn test_ratio_apply_floors() {
        assert_eq!(GENESIS_RULES.agent_share.apply(50 * NOUS), 5 * NOUS);
        assert_eq!(GENESIS_RULES.slash_minor_infraction.apply(15), 1);
        assert_eq!(Ratio::new(1, 1).apply(u64::MAX), u64::MAX);
    }

    #[test]
    fn test_reward_split_covers_whole() {
        let rules = &GENESIS_RULES;
        assert_eq!(
            rules.owner_share.numerator * rules.agent_share.denominator
                + rules.agent_share.numerator * rules.owner_share.denominator,
            rules.owner_share.denominator * rules.agent_share.denominator
        );
    }

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(GENESIS_RULES.content_hash(), GENESIS_RULES.clone().content_hash());
        let mut altered = GENESIS_RULES.clone();
        altered.min_stake += 1;
        assert_ne!(altered.content_hash(), GENESIS_RULES.content_hash());
    }
}
