/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Catch-up tests: a node that misses a few blocks pulls them one by one; a node that misses
//! many downloads the full state and verifies the reconstructed root against the chain.

mod common;

use std::time::Duration;

use common::*;

use byzcoin_rs::block_store::BlockStore;
use byzcoin_rs::messages::{AddTxRequest, GetProofRequest};
use byzcoin_rs::types::basic::{InstanceId, CURRENT_VERSION};

const INTERVAL: Duration = Duration::from_millis(250);

fn mint_one(
    cluster: &Cluster,
    client: &mut Client,
    chain_id: byzcoin_rs::types::basic::ChainId,
    coin: InstanceId,
    amount: u64,
) {
    let tx = client.transaction(vec![mint_coin(coin, amount)]);
    cluster.nodes[0]
        .add_transaction(AddTxRequest {
            version: CURRENT_VERSION,
            chain_id,
            transaction: tx,
            inclusion_wait: 10,
        })
        .unwrap();
}

#[test]
fn lagging_node_pulls_missing_blocks() {
    let cluster = Cluster::new(4, |_| {});
    let mut client = Client::new();
    let (chain_id, genesis_darc) = cluster.create_ledger(
        &client.signer,
        &["spawn:coin", "invoke:coin.mint"],
        INTERVAL,
    );
    let darc_instance = InstanceId::new(genesis_darc.base_id().bytes());

    let coin = coin_instance_id(b"pull coin");
    let tx = client.transaction(vec![
        spawn_coin(darc_instance, b"pull coin"),
        mint_coin(coin, 1),
    ]);
    cluster.nodes[0]
        .add_transaction(AddTxRequest {
            version: CURRENT_VERSION,
            chain_id,
            transaction: tx,
            inclusion_wait: 10,
        })
        .unwrap();
    assert!(wait_until(Duration::from_secs(10), || {
        coin_value(&cluster.nodes[3], chain_id, coin) == Some(1)
    }));

    // Node 3 goes offline and misses five blocks.
    cluster.set_offline(3);
    for i in 0..5u64 {
        mint_one(&cluster, &mut client, chain_id, coin, 10 + i);
    }
    let leader_latest = cluster.stores[0].latest(&chain_id).unwrap().index;
    let behind_latest = cluster.stores[3].latest(&chain_id).unwrap().index;
    assert!(behind_latest < leader_latest);

    // Back online, the next collect-tx round makes it pull every missing block and converge.
    cluster.set_online(3);
    let expected = 1 + (0..5u64).map(|i| 10 + i).sum::<u64>();
    assert!(
        wait_until(Duration::from_secs(20), || {
            coin_value(&cluster.nodes[3], chain_id, coin) == Some(expected)
        }),
        "lagging node did not converge"
    );

    // Root agreement with the leader.
    let root_of = |i: usize| {
        let node = &cluster.nodes[i];
        let block_id = latest_block_id(node, &chain_id).unwrap();
        node.get_proof(GetProofRequest {
            version: CURRENT_VERSION,
            chain_id,
            block_id,
            key: coin,
        })
        .unwrap()
        .proof
        .header
        .trie_root
    };
    assert!(wait_until(Duration::from_secs(10), || {
        root_of(3) == root_of(0)
    }));

    cluster.close();
}

#[test]
fn far_behind_node_downloads_the_state() {
    // Five nodes, so the downloader can pick a non-leader, non-subleader remote; a download
    // threshold of 3 blocks keeps the test fast.
    let cluster = Cluster::new(5, |config| {
        config.catchup_download_all = 3;
    });
    let mut client = Client::new();
    let (chain_id, genesis_darc) = cluster.create_ledger(
        &client.signer,
        &["spawn:coin", "invoke:coin.mint"],
        INTERVAL,
    );
    let darc_instance = InstanceId::new(genesis_darc.base_id().bytes());

    let coin = coin_instance_id(b"download coin");
    let tx = client.transaction(vec![
        spawn_coin(darc_instance, b"download coin"),
        mint_coin(coin, 1),
    ]);
    cluster.nodes[0]
        .add_transaction(AddTxRequest {
            version: CURRENT_VERSION,
            chain_id,
            transaction: tx,
            inclusion_wait: 10,
        })
        .unwrap();
    assert!(wait_until(Duration::from_secs(10), || {
        coin_value(&cluster.nodes[4], chain_id, coin) == Some(1)
    }));

    // Node 4 goes offline and misses more blocks than the download threshold.
    cluster.set_offline(4);
    let mut expected = 1u64;
    for i in 0..6u64 {
        mint_one(&cluster, &mut client, chain_id, coin, 100 + i);
        expected += 100 + i;
    }

    // Back online: the gap exceeds the threshold, so the node wipes its state, downloads the
    // raw trie pages, and verifies the root. The dump shows the downloaded state even before
    // any tail block is stored.
    cluster.set_online(4);
    assert!(
        wait_until(Duration::from_secs(30), || {
            coin_value_from_dump(&cluster.nodes[4], chain_id, coin) == Some(expected)
        }),
        "downloading node did not converge"
    );

    // Fresh blocks arrive through block-pull, after which proofs work again.
    mint_one(&cluster, &mut client, chain_id, coin, 1000);
    expected += 1000;
    assert!(
        wait_until(Duration::from_secs(20), || {
            coin_value(&cluster.nodes[4], chain_id, coin) == Some(expected)
        }),
        "downloaded node fell behind again"
    );

    cluster.close();
}
