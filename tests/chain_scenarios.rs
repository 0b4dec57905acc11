//! End-to-end ledger scenarios through the public chain API

use nouschain::blockchain::{validate_block, Blockchain};
use nouschain::crypto::KeyPair;
use nouschain::error::ChainError;
use nouschain::genesis::{get_block_reward, GenesisConfig, GenesisValidator, GENESIS_RULES, NOUS};
use nouschain::transaction::create_transaction;
use std::collections::BTreeMap;

fn genesis_for(validator: &KeyPair, owner: Option<&KeyPair>) -> GenesisConfig {
    let mut balances = BTreeMap::new();
    balances.insert(validator.address(), 100 * NOUS);
    GenesisConfig {
        validators: vec![GenesisValidator {
            address: validator.address(),
            stake: GENESIS_RULES.min_stake,
            owner: owner.map(|o| o.address()),
        }],
        balances,
    }
}

fn produce(chain: &mut Blockchain, proposer: &KeyPair, count: usize) -> Result<(), ChainError> {
    for _ in 0..count {
        let block = chain.assemble_block(proposer, vec![])?.block;
        chain.apply_block(block)?;
    }
    Ok(())
}

#[test]
fn test_three_empty_blocks_mint_three_rewards() -> Result<(), Box<dyn std::error::Error>> {
    let a = KeyPair::generate();
    let mut chain = Blockchain::new(&genesis_for(&a, None))?;
    let supply_before = chain.ledger().total_supply();

    produce(&mut chain, &a, 3)?;

    assert_eq!(chain.height(), 3);
    assert_eq!(
        chain.ledger().total_supply(),
        supply_before + 3 * GENESIS_RULES.initial_reward
    );
    assert_eq!(chain.account(&a.address()).balance, 100 * NOUS + 150 * NOUS);
    Ok(())
}

#[test]
fn test_agent_rewards_split_with_owner() -> Result<(), Box<dyn std::error::Error>> {
    let a = KeyPair::generate();
    let owner = KeyPair::generate();
    let mut chain = Blockchain::new(&genesis_for(&a, Some(&owner)))?;
    let supply_before = chain.ledger().total_supply();

    produce(&mut chain, &a, 3)?;

    let reward = GENESIS_RULES.initial_reward;
    assert_eq!(chain.height(), 3);
    assert_eq!(chain.ledger().total_supply(), supply_before + 3 * reward);
    assert_eq!(
        chain.account(&owner.address()).balance,
        3 * GENESIS_RULES.owner_share.apply(reward)
    );
    assert_eq!(
        chain.account(&a.address()).balance,
        100 * NOUS + 3 * GENESIS_RULES.agent_share.apply(reward)
    );
    Ok(())
}

#[test]
fn test_replicas_agree_on_state_root() -> Result<(), Box<dyn std::error::Error>> {
    let a = KeyPair::generate();
    let alice = KeyPair::generate();
    let bob = KeyPair::generate();
    let mut genesis = genesis_for(&a, None);
    genesis.balances.insert(alice.address(), 20 * NOUS);

    let mut leader = Blockchain::new(&genesis)?;
    let mut follower = Blockchain::new(&genesis)?;
    assert_eq!(leader.tip().hash(), follower.tip().hash());

    let transfers = vec![
        create_transaction(&alice, bob.address(), 3 * NOUS, 0, 1_000)?,
        create_transaction(&alice, bob.address(), NOUS, 1, 2_000)?,
    ];
    let first = leader.assemble_block(&a, transfers)?.block;
    leader.apply_block(first.clone())?;
    let second = leader.assemble_block(&a, vec![])?.block;
    leader.apply_block(second.clone())?;

    follower.apply_block(first)?;
    follower.apply_block(second)?;

    assert_eq!(follower.height(), 2);
    assert_eq!(follower.state_root(), leader.state_root());
    assert_eq!(follower.account(&bob.address()).balance, 4 * NOUS);
    assert_eq!(follower.account(&alice.address()).nonce, 2);
    Ok(())
}

#[test]
fn test_zero_amount_transfer_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let alice = KeyPair::generate();
    let tx = create_transaction(&alice, KeyPair::generate().address(), 0, 0, 1_000)?;
    assert_eq!(
        tx.is_valid(),
        Err(ChainError::InvalidTransaction("Amount must be positive".to_string()))
    );
    Ok(())
}

#[test]
fn test_wrong_nonce_has_no_partial_effect() -> Result<(), Box<dyn std::error::Error>> {
    let a = KeyPair::generate();
    let bob = KeyPair::generate();
    let chain = Blockchain::new(&genesis_for(&a, None))?;
    let mut ledger = chain.ledger().clone();

    let tx = create_transaction(&a, bob.address(), NOUS, 3, 0)?;
    assert!(matches!(
        ledger.apply_transaction(&tx),
        Err(ChainError::InvalidNonce { expected: 0, got: 3 })
    ));
    assert_eq!(ledger.get_balance(&a.address()), 100 * NOUS);
    assert_eq!(ledger.get_balance(&bob.address()), 0);
    assert_eq!(ledger.state_root(), chain.state_root());
    Ok(())
}

#[test]
fn test_block_checks_are_independent() -> Result<(), Box<dyn std::error::Error>> {
    let a = KeyPair::generate();
    let mut chain = Blockchain::new(&genesis_for(&a, None))?;
    produce(&mut chain, &a, 1)?;
    let tip = chain.tip().clone();
    let good = chain.assemble_block(&a, vec![])?.block;
    let total = chain.total_validators();
    validate_block(&good, Some(&tip), chain.ledger(), total)?;

    let mut skipped = good.clone();
    skipped.header.height += 1;
    skipped.sign(&a)?;
    assert!(validate_block(&skipped, Some(&tip), chain.ledger(), total).is_err());

    let mut wrong_parent = good.clone();
    wrong_parent.header.previous_hash = [9u8; 32];
    wrong_parent.sign(&a)?;
    assert!(validate_block(&wrong_parent, Some(&tip), chain.ledger(), total).is_err());

    let mut unstaked = chain.ledger().clone();
    unstaked.unstake(&a.address(), GENESIS_RULES.min_stake)?;
    assert!(matches!(
        validate_block(&good, Some(&tip), &unstaked, total),
        Err(ChainError::ConsensusViolation(_))
    ));
    Ok(())
}

#[test]
fn test_reward_schedule_halves_to_zero() {
    let interval = GENESIS_RULES.halving_interval;
    assert_eq!(get_block_reward(0), GENESIS_RULES.initial_reward);
    assert_eq!(get_block_reward(interval - 1), GENESIS_RULES.initial_reward);
    assert_eq!(get_block_reward(interval), GENESIS_RULES.initial_reward / 2);
    assert_eq!(get_block_reward(2 * interval - 1), GENESIS_RULES.initial_reward / 2);
    assert_eq!(get_block_reward(64 * interval), 0);
    assert_eq!(get_block_reward(u64::MAX), 0);
}
