/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Leader-failure test: killing the leader stops block production until the cohort rotates
//! leadership through a view-change block, after which client transactions commit on the new
//! leader.

mod common;

use std::time::Duration;

use common::*;

use byzcoin_rs::block_store::BlockStore;
use byzcoin_rs::messages::AddTxRequest;
use byzcoin_rs::types::basic::{InstanceId, CURRENT_VERSION};

const INTERVAL: Duration = Duration::from_millis(400);

#[test]
fn leader_failure_rotates_leadership() {
    let cluster = Cluster::new(4, |config| {
        // A tight heartbeat window keeps the test short: the view change fires after
        // 4 × interval without a leader poll.
        config.rotation_window = 4;
    });
    let mut client = Client::new();
    let (chain_id, genesis_darc) = cluster.create_ledger(
        &client.signer,
        &["spawn:coin", "invoke:coin.mint"],
        INTERVAL,
    );
    let darc_instance = InstanceId::new(genesis_darc.base_id().bytes());

    assert!(
        wait_until(Duration::from_secs(10), || {
            cluster.stores.iter().all(|s| s.genesis(&chain_id).is_some())
        }),
        "genesis did not reach every node"
    );

    // A healthy commit first.
    let coin = coin_instance_id(b"pre-failure");
    let tx = client.transaction(vec![
        spawn_coin(darc_instance, b"pre-failure"),
        mint_coin(coin, 1),
    ]);
    cluster.nodes[1]
        .add_transaction(AddTxRequest {
            version: CURRENT_VERSION,
            chain_id,
            transaction: tx,
            inclusion_wait: 10,
        })
        .unwrap();

    // Kill the leader.
    let old_leader = cluster.node_id(0);
    cluster.set_offline(0);

    // The followers must rotate leadership through a view-change block.
    assert!(
        wait_until(Duration::from_secs(30), || {
            cluster.nodes[1]
                .load_config(&chain_id)
                .map(|config| config.roster.leader() != Some(&old_leader))
                .unwrap_or(false)
        }),
        "leadership did not rotate away from the dead leader"
    );
    let config = cluster.nodes[1].load_config(&chain_id).unwrap();
    // The roster membership is unchanged; only the order rotated.
    let original = cluster.roster();
    assert_eq!(config.roster.len(), original.len());
    assert!(original.is_one_step_from(&config.roster));
    assert!(config.roster.contains(&old_leader));

    // Client transactions commit on the new leader.
    let coin2 = coin_instance_id(b"post-failure");
    let tx = client.transaction(vec![
        spawn_coin(darc_instance, b"post-failure"),
        mint_coin(coin2, 5),
    ]);
    cluster.nodes[1]
        .add_transaction(AddTxRequest {
            version: CURRENT_VERSION,
            chain_id,
            transaction: tx,
            inclusion_wait: 10,
        })
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(10), || {
            (1..4).all(|i| coin_value(&cluster.nodes[i], chain_id, coin2) == Some(5))
        }),
        "the rotated cohort stopped committing"
    );

    cluster.close();
}
