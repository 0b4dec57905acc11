use crate::crypto::Address;
use crate::error::ChainError;
use crate::genesis::{Ratio, GENESIS_RULES};
use crate::transaction::Transaction;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::block::Sha256Hash;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Account {
    pub address: Address,
    /// Balance in nouslings, staked amount included
    pub balance: u64,
    pub nonce: u64,
    pub staked: u64,
    pub reputation: i64,
    pub is_agent: bool,
    pub owner: Option<Address>,
}

impl Account {
    pub fn new(address: Address) -> Self {
        Account {
            address,
            balance: 0,
            nonce: 0,
            staked: 0,
            reputation: 0,
            is_agent: false,
            owner: None,
        }
    }

    /// Balance minus staked amount.
    pub fn available_balance(&self) -> u64 {
        self.balance.saturating_sub(self.staked)
    }

    fn is_empty(&self) -> bool {
        self.balance == 0 && self.nonce == 0 && self.staked == 0
    }
}

/// Account-balance state machine.
///
/// Methods take `&mut self`; callers sharing a ledger across tasks hold one
/// exclusive lock around each mutation so check-then-act sequences (nonce and
/// balance checks, the supply ceiling in `mint`) cannot interleave.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Ledger {
    accounts: BTreeMap<Address, Account>,
    total_supply: u64,
    max_supply: u64,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    pub fn new() -> Self {
        Self::with_max_supply(GENESIS_RULES.max_supply)
    }

    pub fn with_max_supply(max_supply: u64) -> Self {
        Ledger {
            accounts: BTreeMap::new(),
            total_supply: 0,
            max_supply,
        }
    }

    pub fn total_supply(&self) -> u64 {
        self.total_supply
    }

    pub fn max_supply(&self) -> u64 {
        self.max_supply
    }

    pub fn remaining_supply(&self) -> u64 {
        self.max_supply.saturating_sub(self.total_supply)
    }

    /// Existing account, or a zero-initialized one created on first reference.
    pub fn get_account(&mut self, address: &Address) -> &mut Account {
        self.accounts
            .entry(address.clone())
            .or_insert_with(|| Account::new(address.clone()))
    }

    /// Read-only snapshot of an account; absent accounts read as zero.
    pub fn account(&self, address: &Address) -> Account {
        self.accounts
            .get(address)
            .cloned()
            .unwrap_or_else(|| Account::new(address.clone()))
    }

    pub fn get_balance(&self, address: &Address) -> u64 {
        self.accounts.get(address).map_or(0, |a| a.balance)
    }

    pub fn accounts(&self) -> impl Iterator<Item = &Account> {
        self.accounts.values()
    }

    /// Sum of all balances. Equals `total_supply` while every credit goes
    /// through minting or transfers.
    pub fn total_balances(&self) -> u128 {
        self.accounts.values().map(|a| a.balance as u128).sum()
    }

    /// Checks structure, nonce and balance without mutating anything.
    pub fn check_transaction(&self, tx: &Transaction) -> Result<(), ChainError> {
        tx.is_valid()?;

        let sender = self.accounts.get(&tx.sender);
        let expected_nonce = sender.map_or(0, |a| a.nonce);
        if tx.nonce != expected_nonce {
            return Err(ChainError::InvalidNonce {
                expected: expected_nonce,
                got: tx.nonce,
            });
        }

        let total_cost = tx.total_cost()?;
        let available = sender.map_or(0, |a| a.available_balance());
        if available < total_cost {
            return Err(ChainError::InsufficientBalance {
                needed: total_cost,
                available,
            });
        }

        let recipient_balance = self.get_balance(&tx.recipient);
        if recipient_balance.checked_add(tx.amount).is_none() {
            return Err(ChainError::InvalidTransaction(
                "Recipient balance would overflow".to_string(),
            ));
        }
        Ok(())
    }

    /// Applies a transfer. Nonce must equal the sender's nonce exactly and
    /// `amount + fee` must be covered by the available balance. On error
    /// nothing is modified.
    pub fn apply_transaction(&mut self, tx: &Transaction) -> Result<(), ChainError> {
        self.check_transaction(tx)?;
        let total_cost = tx.total_cost()?;

        let sender = self.get_account(&tx.sender);
        sender.balance -= total_cost;
        sender.nonce += 1;

        self.get_account(&tx.recipient).balance += tx.amount;
        Ok(())
    }

    /// Creates new supply, refusing anything past the ceiling.
    pub fn mint(&mut self, address: &Address, amount: u64) -> Result<(), ChainError> {
        let remaining = self.remaining_supply();
        if amount > remaining {
            return Err(ChainError::SupplyExceeded {
                requested: amount,
                remaining,
            });
        }
        self.get_account(address).balance += amount;
        self.total_supply += amount;
        Ok(())
    }

    /// Moves existing value to `address` without touching supply.
    pub fn credit_fees(&mut self, address: &Address, amount: u64) {
        if amount > 0 {
            self.get_account(address).balance += amount;
        }
    }

    /// Removes value from circulation.
    pub fn burn(&mut self, amount: u64) {
        self.total_supply = self.total_supply.saturating_sub(amount);
    }

    pub fn stake(&mut self, address: &Address, amount: u64) -> Result<(), ChainError> {
        let account = self.get_account(address);
        let available = account.available_balance();
        if available < amount {
            return Err(ChainError::InsufficientBalance {
                needed: amount,
                available,
            });
        }
        account.staked += amount;
        Ok(())
    }

    pub fn unstake(&mut self, address: &Address, amount: u64) -> Result<(), ChainError> {
        let account = self.get_account(address);
        if account.staked < amount {
            return Err(ChainError::InsufficientStake {
                needed: amount,
                available: account.staked,
            });
        }
        account.staked -= amount;
        Ok(())
    }

    /// Burns `percentage` of a validator's stake. Returns the amount slashed.
    pub fn slash(&mut self, address: &Address, percentage: Ratio) -> u64 {
        let account = self.get_account(address);
        let slash_amount = percentage.apply(account.staked).min(account.staked);
        account.staked -= slash_amount;
        account.balance -= slash_amount;
        self.total_supply = self.total_supply.saturating_sub(slash_amount);
        slash_amount
    }

    /// Creates an agent account staked with `initial_stake` taken from its owner.
    pub fn register_agent(
        &mut self,
        agent: &Address,
        owner: &Address,
        initial_stake: u64,
    ) -> Result<(), ChainError> {
        if agent == owner {
            return Err(ChainError::InvalidTransaction(
                "Agent cannot own itself".to_string(),
            ));
        }
        let owner_account = self.get_account(owner);
        let available = owner_account.available_balance();
        if available < initial_stake {
            return Err(ChainError::InsufficientBalance {
                needed: initial_stake,
                available,
            });
        }
        owner_account.balance -= initial_stake;

        let agent_account = self.get_account(agent);
        agent_account.balance += initial_stake;
        agent_account.staked += initial_stake;
        agent_account.is_agent = true;
        agent_account.owner = Some(owner.clone());
        Ok(())
    }

    /// Mints a block reward. An agent with a recorded owner receives
    /// `agent_share` and the owner the remainder; anyone else gets it all.
    /// Either both mints happen or neither does.
    pub fn distribute_reward(
        &mut self,
        proposer: &Address,
        reward: u64,
        agent_share: Ratio,
    ) -> Result<(), ChainError> {
        let owner = {
            let account = self.get_account(proposer);
            match (&account.owner, account.is_agent) {
                (Some(owner), true) => Some(owner.clone()),
                _ => None,
            }
        };

        let Some(owner) = owner else {
            return self.mint(proposer, reward);
        };

        let remaining = self.remaining_supply();
        if reward > remaining {
            return Err(ChainError::SupplyExceeded {
                requested: reward,
                remaining,
            });
        }

        let agent_reward = agent_share.apply(reward);
        let owner_reward = reward - agent_reward;
        self.mint(proposer, agent_reward)?;
        self.mint(&owner, owner_reward)?;
        Ok(())
    }

    /// Digest over all non-empty accounts in address order, covering
    /// balance, nonce and stake.
    pub fn state_root(&self) -> Sha256Hash {
        let mut hasher = Sha256::new();
        for (address, account) in self.accounts.iter().filter(|(_, a)| !a.is_empty()) {
            let bytes = address.as_str().as_bytes();
            hasher.update((bytes.len() as u32).to_le_bytes());
            hasher.update(bytes);
            hasher.update(account.balance.to_le_bytes());
            hasher.update(account.nonce.to_le_bytes());
            hasher.update(account.staked.to_le_bytes());
        }
        hasher.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::genesis::NOUS;
    use crate::transaction::create_transaction;

    fn funded(amount: u64) -> (Ledger, KeyPair) {
        let mut ledger = Ledger::new();
        let keypair = KeyPair::generate();
        ledger.mint(&keypair.address(), amount).unwrap();
        (ledger, keypair)
    }

    #[test]
    fn test_get_account_creates_zero_account() {
        let mut ledger = Ledger::new();
        let address = KeyPair::generate().address();
        let account = ledger.get_account(&address);
        assert_eq!(account.balance, 0);
        assert_eq!(account.nonce, 0);
        assert_eq!(ledger.account(&address).staked, 0);
    }

    #[test]
    fn test_apply_transaction_moves_value() {
        let (mut ledger, alice) = funded(1_000);
        let bob = KeyPair::generate().address();
        let tx = create_transaction(&alice, bob.clone(), 300, 0, 10).unwrap();

        ledger.apply_transaction(&tx).unwrap();

        let sender = ledger.account(&alice.address());
        assert_eq!(sender.balance, 690);
        assert_eq!(sender.nonce, 1);
        assert_eq!(ledger.get_balance(&bob), 300);
    }

    #[test]
    fn test_wrong_nonce_leaves_state_unchanged() {
        let (mut ledger, alice) = funded(1_000);
        let bob = KeyPair::generate().address();
        let before = ledger.clone();

        for nonce in [1, 5] {
            let tx = create_transaction(&alice, bob.clone(), 100, nonce, 0).unwrap();
            let err = ledger.apply_transaction(&tx).unwrap_err();
            assert_eq!(err, ChainError::InvalidNonce { expected: 0, got: nonce });
        }
        assert_eq!(ledger, before);
        assert_eq!(ledger.get_balance(&bob), 0);
    }

    #[test]
    fn test_insufficient_balance_counts_fee_and_stake() {
        let (mut ledger, alice) = funded(1_000);
        ledger.stake(&alice.address(), 600).unwrap();
        let bob = KeyPair::generate().address();

        let tx = create_transaction(&alice, bob, 395, 0, 10).unwrap();
        let err = ledger.apply_transaction(&tx).unwrap_err();
        assert_eq!(err, ChainError::InsufficientBalance { needed: 405, available: 400 });
        assert_eq!(ledger.account(&alice.address()).nonce, 0);
    }

    #[test]
    fn test_mint_respects_ceiling() {
        let mut ledger = Ledger::with_max_supply(100);
        let address = KeyPair::generate().address();
        ledger.mint(&address, 60).unwrap();
        let err = ledger.mint(&address, 41).unwrap_err();
        assert_eq!(err, ChainError::SupplyExceeded { requested: 41, remaining: 40 });
        assert_eq!(ledger.total_supply(), 60);
        ledger.mint(&address, 40).unwrap();
        assert_eq!(ledger.total_supply(), ledger.max_supply());
    }

    #[test]
    fn test_stake_and_unstake() {
        let (mut ledger, alice) = funded(500);
        let address = alice.address();
        ledger.stake(&address, 200).unwrap();
        assert_eq!(ledger.account(&address).available_balance(), 300);
        assert!(ledger.stake(&address, 301).is_err());
        assert_eq!(
            ledger.unstake(&address, 201).unwrap_err(),
            ChainError::InsufficientStake { needed: 201, available: 200 }
        );
        ledger.unstake(&address, 200).unwrap();
        assert_eq!(ledger.account(&address).staked, 0);
    }

    #[test]
    fn test_slash_burns_supply() {
        let (mut ledger, alice) = funded(1_000);
        let address = alice.address();
        ledger.stake(&address, 500).unwrap();

        let slashed = ledger.slash(&address, GENESIS_RULES.slash_minor_infraction);
        assert_eq!(slashed, 50);
        let account = ledger.account(&address);
        assert_eq!(account.staked, 450);
        assert_eq!(account.balance, 950);
        assert_eq!(ledger.total_supply(), 950);

        let slashed = ledger.slash(&address, GENESIS_RULES.slash_genesis_violation);
        assert_eq!(slashed, 450);
        assert_eq!(ledger.account(&address).staked, 0);
        assert_eq!(ledger.total_supply(), 500);
    }

    #[test]
    fn test_distribute_reward_to_agent_and_owner() {
        let (mut ledger, owner) = funded(1_000 * NOUS);
        let agent = KeyPair::generate().address();
        ledger.register_agent(&agent, &owner.address(), 100 * NOUS).unwrap();

        ledger
            .distribute_reward(&agent, 50 * NOUS, GENESIS_RULES.agent_share)
            .unwrap();

        assert_eq!(ledger.get_balance(&agent), 105 * NOUS);
        assert_eq!(ledger.get_balance(&owner.address()), 945 * NOUS);
        assert_eq!(ledger.total_supply(), 1_050 * NOUS);
    }

    #[test]
    fn test_distribute_reward_non_agent_gets_everything() {
        let mut ledger = Ledger::new();
        let proposer = KeyPair::generate().address();
        ledger
            .distribute_reward(&proposer, 50 * NOUS, GENESIS_RULES.agent_share)
            .unwrap();
        assert_eq!(ledger.get_balance(&proposer), 50 * NOUS);
    }

    #[test]
    fn test_distribute_reward_is_atomic_at_ceiling() {
        let mut ledger = Ledger::with_max_supply(1_000);
        let owner = KeyPair::generate().address();
        let agent = KeyPair::generate().address();
        ledger.mint(&owner, 900).unwrap();
        ledger.register_agent(&agent, &owner, 100).unwrap();
        let before = ledger.clone();

        assert!(ledger.distribute_reward(&agent, 150, GENESIS_RULES.agent_share).is_err());
        assert_eq!(ledger, before);
    }

    #[test]
    fn test_state_root_ignores_touched_empty_accounts() {
        let (mut ledger, _) = funded(1_000);
        let root = ledger.state_root();
        ledger.get_account(&KeyPair::generate().address());
        assert_eq!(ledger.state_root(), root);
    }

    #[test]
    fn test_state_root_tracks_nonce_and_stake() {
        let (mut ledger, alice) = funded(1_000);
        let root = ledger.state_root();
        ledger.stake(&alice.address(), 10).unwrap();
        let staked_root = ledger.state_root();
        assert_ne!(root, staked_root);
        ledger.get_account(&alice.address()).nonce += 1;
        assert_ne!(ledger.state_root(), staked_root);
    }

    #[test]
    fn test_supply_never_exceeds_ceiling_under_transfers() {
        let (mut ledger, alice) = funded(10_000);
        let bob = KeyPair::generate();
        for nonce in 0..20 {
            let tx = create_transaction(&alice, bob.address(), 100, nonce, 5).unwrap();
            ledger.apply_transaction(&tx).unwrap();
            assert!(ledger.total_supply() <= ledger.max_supply());
            for account in ledger.accounts() {
                assert!(account.staked <= account.balance);
            }
        }
        assert_eq!(ledger.account(&alice.address()).balance, 10_000 - 20 * 105);
    }
}
