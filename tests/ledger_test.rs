/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! End-to-end ledger tests over a four-node cluster: spawning and minting coins, transfers,
//! replay rejection, proofs of presence and absence, signer counters, authorization checks and
//! the instance-version history.

mod common;

use std::time::Duration;

use common::*;

use byzcoin_rs::block_store::BlockStore;
use byzcoin_rs::messages::*;
use byzcoin_rs::service::ServiceError;
use byzcoin_rs::state::ProofResult;
use byzcoin_rs::types::basic::{InstanceId, CURRENT_VERSION};
use byzcoin_rs::types::transaction::state_changes_hash;

const INTERVAL: Duration = Duration::from_millis(300);

#[test]
fn coin_lifecycle_across_the_cluster() {
    let cluster = Cluster::new(4, |_| {});
    let mut client = Client::new();
    let (chain_id, genesis_darc) = cluster.create_ledger(
        &client.signer,
        &["spawn:coin", "invoke:coin.mint", "invoke:coin.transfer"],
        INTERVAL,
    );
    let darc_instance = InstanceId::new(genesis_darc.base_id().bytes());

    assert!(
        wait_until(Duration::from_secs(10), || {
            cluster.stores.iter().all(|s| s.genesis(&chain_id).is_some())
        }),
        "genesis did not reach every node"
    );

    // Spawn a coin and mint 1000 onto it, in one transaction.
    let seed = client.identity().public_bytes();
    let coin = coin_instance_id(&seed);
    let tx = client.transaction(vec![
        spawn_coin(darc_instance, &seed),
        mint_coin(coin, 1000),
    ]);
    cluster.nodes[0]
        .add_transaction(AddTxRequest {
            version: CURRENT_VERSION,
            chain_id,
            transaction: tx.clone(),
            inclusion_wait: 10,
        })
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(10), || {
            cluster
                .nodes
                .iter()
                .all(|n| coin_value(n, chain_id, coin) == Some(1000))
        }),
        "mint did not reach every node"
    );

    // The signer signed two accepted instructions.
    let counters = cluster.nodes[0]
        .get_signer_counters(GetSignerCountersRequest {
            chain_id,
            signer_ids: vec![client.identity()],
        })
        .unwrap();
    assert_eq!(counters.counters, vec![2]);

    // Replaying the same transaction verbatim is included but refused, and changes nothing.
    let replay = cluster.nodes[1].add_transaction(AddTxRequest {
        version: CURRENT_VERSION,
        chain_id,
        transaction: tx,
        inclusion_wait: 10,
    });
    assert!(
        matches!(&replay, Err(ServiceError::Unauthorized(_))),
        "replay must be refused, got {:?}",
        replay
    );
    assert_eq!(coin_value(&cluster.nodes[0], chain_id, coin), Some(1000));
    let counters = cluster.nodes[0]
        .get_signer_counters(GetSignerCountersRequest {
            chain_id,
            signer_ids: vec![client.identity()],
        })
        .unwrap();
    assert_eq!(counters.counters, vec![2]);

    // Spawn a second coin and transfer 50 over, submitted through a follower.
    let coin2 = coin_instance_id(b"second coin");
    let tx = client.transaction(vec![
        spawn_coin(darc_instance, b"second coin"),
        transfer_coin(coin, coin2, 50),
    ]);
    cluster.nodes[2]
        .add_transaction(AddTxRequest {
            version: CURRENT_VERSION,
            chain_id,
            transaction: tx,
            inclusion_wait: 10,
        })
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(10), || {
            cluster.nodes.iter().all(|n| {
                coin_value(n, chain_id, coin) == Some(950)
                    && coin_value(n, chain_id, coin2) == Some(50)
            })
        }),
        "transfer did not reach every node"
    );

    // Every node sits on the same trie root.
    let roots: Vec<_> = cluster
        .nodes
        .iter()
        .map(|n| {
            let block_id = latest_block_id(n, &chain_id).unwrap();
            n.get_proof(GetProofRequest {
                version: CURRENT_VERSION,
                chain_id,
                block_id,
                key: coin,
            })
            .unwrap()
            .proof
            .header
            .trie_root
        })
        .collect();
    assert!(roots.windows(2).all(|pair| pair[0] == pair[1]));

    cluster.close();
}

#[test]
fn proofs_of_presence_and_absence() {
    let cluster = Cluster::new(3, |_| {});
    let mut client = Client::new();
    let (chain_id, genesis_darc) =
        cluster.create_ledger(&client.signer, &["spawn:coin", "invoke:coin.mint"], INTERVAL);
    let darc_instance = InstanceId::new(genesis_darc.base_id().bytes());

    let coin = coin_instance_id(b"proven coin");
    let tx = client.transaction(vec![
        spawn_coin(darc_instance, b"proven coin"),
        mint_coin(coin, 7),
    ]);
    cluster.nodes[0]
        .add_transaction(AddTxRequest {
            version: CURRENT_VERSION,
            chain_id,
            transaction: tx,
            inclusion_wait: 10,
        })
        .unwrap();

    let block_id = latest_block_id(&cluster.nodes[0], &chain_id).unwrap();
    let present = cluster.nodes[0]
        .get_proof(GetProofRequest {
            version: CURRENT_VERSION,
            chain_id,
            block_id,
            key: coin,
        })
        .unwrap();
    match present.proof.verify(&chain_id).unwrap() {
        ProofResult::Present(_) => {}
        ProofResult::Absent => panic!("expected a proof of presence"),
    }

    let absent = cluster.nodes[0]
        .get_proof(GetProofRequest {
            version: CURRENT_VERSION,
            chain_id,
            block_id,
            key: InstanceId::new([0xfe; 32]),
        })
        .unwrap();
    assert_eq!(absent.proof.verify(&chain_id).unwrap(), ProofResult::Absent);
    assert!(absent.proof.key_value().is_none());

    cluster.close();
}

#[test]
fn authorization_and_history_queries() {
    let cluster = Cluster::new(3, |_| {});
    let mut client = Client::new();
    let (chain_id, genesis_darc) =
        cluster.create_ledger(&client.signer, &["spawn:coin", "invoke:coin.mint"], INTERVAL);
    let darc_instance = InstanceId::new(genesis_darc.base_id().bytes());

    // The genesis darc's owner satisfies its administrative rules; a stranger satisfies none.
    let actions = cluster.nodes[0]
        .check_authorization(CheckAuthorizationRequest {
            version: CURRENT_VERSION,
            chain_id,
            darc_id: genesis_darc.base_id(),
            identities: vec![client.identity()],
        })
        .unwrap();
    assert!(actions.actions.contains(&"_sign".to_string()));
    assert!(actions.actions.contains(&"spawn:coin".to_string()));

    let stranger = Client::new();
    let actions = cluster.nodes[0]
        .check_authorization(CheckAuthorizationRequest {
            version: CURRENT_VERSION,
            chain_id,
            darc_id: genesis_darc.base_id(),
            identities: vec![stranger.identity()],
        })
        .unwrap();
    assert!(actions.actions.is_empty());

    // Two mints move the coin through versions 1 and 2.
    let coin = coin_instance_id(b"history coin");
    for amount in [10u64, 20] {
        let parts = if amount == 10 {
            vec![spawn_coin(darc_instance, b"history coin"), mint_coin(coin, amount)]
        } else {
            vec![mint_coin(coin, amount)]
        };
        let tx = client.transaction(parts);
        cluster.nodes[0]
            .add_transaction(AddTxRequest {
                version: CURRENT_VERSION,
                chain_id,
                transaction: tx,
                inclusion_wait: 10,
            })
            .unwrap();
    }

    let all = cluster.nodes[0]
        .get_all_instance_version(GetAllInstanceVersionRequest {
            chain_id,
            instance_id: coin,
        })
        .unwrap();
    assert_eq!(all.state_changes.len(), 3);
    assert_eq!(all.state_changes[0].state_change.version, 0);
    assert_eq!(all.state_changes[2].state_change.version, 2);

    let last = cluster.nodes[0]
        .get_last_instance_version(GetLastInstanceVersionRequest {
            chain_id,
            instance_id: coin,
        })
        .unwrap();
    assert_eq!(last.state_change.version, 2);

    let by_version = cluster.nodes[0]
        .get_instance_version(GetInstanceVersionRequest {
            chain_id,
            instance_id: coin,
            version: 1,
        })
        .unwrap();
    assert_eq!(by_version.state_change.version, 1);

    // The auditor path: the returned state changes hash to what the block header committed.
    let validity = cluster.nodes[0]
        .check_state_change_validity(CheckStateChangeValidityRequest {
            chain_id,
            instance_id: coin,
            version: 1,
        })
        .unwrap();
    let block = cluster.stores[0].get(&validity.block_id).unwrap();
    assert_eq!(
        state_changes_hash(&validity.state_changes),
        block.header.state_changes_hash
    );

    cluster.close();
}

#[test]
fn input_validation() {
    let cluster = Cluster::new(1, |_| {});
    let mut client = Client::new();
    let (chain_id, genesis_darc) =
        cluster.create_ledger(&client.signer, &["spawn:coin"], INTERVAL);
    let darc_instance = InstanceId::new(genesis_darc.base_id().bytes());
    let tx = client.transaction(vec![spawn_coin(darc_instance, b"seed")]);

    // Wrong version.
    let err = cluster.nodes[0].add_transaction(AddTxRequest {
        version: CURRENT_VERSION + 1,
        chain_id,
        transaction: tx.clone(),
        inclusion_wait: 0,
    });
    assert!(matches!(err, Err(ServiceError::VersionMismatch { .. })));

    // Unknown chain.
    let err = cluster.nodes[0].add_transaction(AddTxRequest {
        version: CURRENT_VERSION,
        chain_id: byzcoin_rs::types::basic::ChainId::new([9u8; 32]),
        transaction: tx.clone(),
        inclusion_wait: 0,
    });
    assert!(matches!(err, Err(ServiceError::UnknownChain(_))));

    // Empty transaction.
    let err = cluster.nodes[0].add_transaction(AddTxRequest {
        version: CURRENT_VERSION,
        chain_id,
        transaction: byzcoin_rs::types::transaction::ClientTransaction::new(Vec::new()),
        inclusion_wait: 0,
    });
    assert!(matches!(err, Err(ServiceError::InvalidInput(_))));

    cluster.close();
}

#[test]
fn debug_dump_and_remove() {
    let cluster = Cluster::new(1, |_| {});
    let mut client = Client::new();
    let (chain_id, genesis_darc) =
        cluster.create_ledger(&client.signer, &["spawn:coin", "invoke:coin.mint"], INTERVAL);
    let darc_instance = InstanceId::new(genesis_darc.base_id().bytes());

    let coin = coin_instance_id(b"dumped coin");
    let tx = client.transaction(vec![
        spawn_coin(darc_instance, b"dumped coin"),
        mint_coin(coin, 5),
    ]);
    cluster.nodes[0]
        .add_transaction(AddTxRequest {
            version: CURRENT_VERSION,
            chain_id,
            transaction: tx,
            inclusion_wait: 10,
        })
        .unwrap();

    let listing = cluster.nodes[0]
        .debug_dump(DebugRequest { chain_id: None })
        .unwrap();
    assert_eq!(listing.chains.len(), 1);
    assert_eq!(listing.chains[0].chain_id, chain_id);

    let dump = cluster.nodes[0]
        .debug_dump(DebugRequest {
            chain_id: Some(chain_id),
        })
        .unwrap();
    assert!(dump.dump.iter().any(|entry| entry.key == coin));

    // Removal requires a signature under the node's own key.
    let bad = cluster.nodes[0].debug_remove(DebugRemoveRequest {
        chain_id,
        signature: vec![0u8; 64],
    });
    assert!(matches!(bad, Err(ServiceError::Unauthorized(_))));

    let signature =
        byzcoin_rs::service::sign_debug_remove(&cluster.node_keys[0], &chain_id);
    cluster.nodes[0]
        .debug_remove(DebugRemoveRequest {
            chain_id,
            signature,
        })
        .unwrap();
    let err = cluster.nodes[0].get_proof(GetProofRequest {
        version: CURRENT_VERSION,
        chain_id,
        block_id: byzcoin_rs::types::basic::BlockId::new([0u8; 32]),
        key: coin,
    });
    assert!(err.is_err());

    cluster.close();
}
