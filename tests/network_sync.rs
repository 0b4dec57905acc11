//! Two nodes on localhost: handshake, gossip and catch-up sync

use nouschain::config::Config;
use nouschain::crypto::KeyPair;
use nouschain::genesis::{GenesisConfig, GenesisValidator, GENESIS_RULES, NOUS};
use nouschain::node::{Node, NodeState};
use nouschain::transaction::create_transaction;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn shared_genesis(validator: &KeyPair, user: &KeyPair) -> GenesisConfig {
    let mut balances = BTreeMap::new();
    balances.insert(validator.address(), GENESIS_RULES.min_stake);
    balances.insert(user.address(), 50 * NOUS);
    GenesisConfig {
        validators: vec![GenesisValidator {
            address: validator.address(),
            stake: GENESIS_RULES.min_stake,
            owner: None,
        }],
        balances,
    }
}

fn local_config(genesis: &GenesisConfig, bootstrap: Vec<String>) -> Config {
    let mut config = Config::default();
    config.network.listen_host = "127.0.0.1".to_string();
    config.network.p2p_port = 0;
    config.network.bootstrap_peers = bootstrap;
    config.genesis = genesis.clone();
    config
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_lagging_node_syncs_on_start() {
    tokio::time::timeout(Duration::from_secs(20), async {
        let validator = KeyPair::generate();
        let user = KeyPair::generate();
        let genesis = shared_genesis(&validator, &user);

        let leader = Node::new(local_config(&genesis, vec![]), validator).unwrap();
        let leader_addr = leader.start().await.unwrap();
        for _ in 0..5 {
            leader.produce_block().unwrap().unwrap();
        }
        assert_eq!(leader.height(), 5);

        let follower = Node::new(
            local_config(&genesis, vec![leader_addr.to_string()]),
            KeyPair::generate(),
        )
        .unwrap();
        follower.start().await.unwrap();

        assert_eq!(follower.state(), NodeState::Ready);
        assert_eq!(follower.height(), 5);
        assert_eq!(
            follower.chain().read().state_root(),
            leader.chain().read().state_root()
        );
        assert_eq!(follower.stats().peers, 1);
        assert!(!follower.stats().syncing);

        follower.stop();
        leader.stop();
    })
    .await
    .expect("test_lagging_node_syncs_on_start timed out");
}

#[tokio::test]
async fn test_transaction_and_block_gossip() {
    tokio::time::timeout(Duration::from_secs(20), async {
        let validator = KeyPair::generate();
        let user = KeyPair::generate();
        let recipient = KeyPair::generate().address();
        let genesis = shared_genesis(&validator, &user);

        let leader = Node::new(local_config(&genesis, vec![]), validator).unwrap();
        let leader_addr = leader.start().await.unwrap();
        let follower: Arc<Node> = Node::new(
            local_config(&genesis, vec![leader_addr.to_string()]),
            KeyPair::generate(),
        )
        .unwrap();
        follower.start().await.unwrap();
        wait_until(|| leader.stats().peers == 1).await;

        // submitted at the follower, gossiped to the producer
        let tx = create_transaction(&user, recipient.clone(), 7 * NOUS, 0, 1_000).unwrap();
        let tx_id = follower.submit_transaction(tx).unwrap();
        wait_until(|| leader.transaction(&tx_id).is_some()).await;

        let block = leader.produce_block().unwrap().unwrap();
        assert_eq!(block.transactions.len(), 1);

        // announced back and applied by the follower
        wait_until(|| follower.height() == 1).await;
        assert_eq!(follower.balance(&recipient), 7 * NOUS);
        assert_eq!(follower.stats().pending_txs, 0);
        assert_eq!(
            follower.chain().read().state_root(),
            leader.chain().read().state_root()
        );

        // the producer's attestation reaches the follower
        wait_until(|| follower.stats().finalized_height == 1).await;

        follower.stop();
        leader.stop();
    })
    .await
    .expect("test_transaction_and_block_gossip timed out");
}
