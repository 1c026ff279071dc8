//! End-to-end cluster test: real nodes over the in-memory transport with
//! the system clock driving one-second epochs.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use triad_config::{Config, GenesisValidator};
use triad_crypto::PrivateKey;
use triad_node::Node;
use triad_p2p::ChannelNetwork;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

fn cluster_config(keys: &[PrivateKey], genesis_ts: u64) -> Config {
    let mut config = Config::default();
    config.consensus.epoch_ms = 1_000;
    config.consensus.min_num_validators = 3;
    config.genesis.timestamp = genesis_ts;
    config.genesis.validators = keys
        .iter()
        .map(|k| GenesisValidator {
            address: k.address().into(),
            stake: 100_000,
        })
        .collect();
    config.validate().unwrap();
    config
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn four_nodes_finalize_together() {
    let keys: Vec<PrivateKey> = (0..4).map(|_| PrivateKey::random()).collect();
    let genesis_ts = now_ms();
    let config = cluster_config(&keys, genesis_ts);

    let network = ChannelNetwork::new();
    let mut nodes = Vec::new();
    let mut pending = Vec::new();
    for (i, key) in keys.iter().enumerate() {
        let (transport, frames) = network.join(format!("node-{}", i));
        let node = Node::build(config.clone(), key.clone(), Arc::new(transport)).unwrap();
        pending.push((node, frames));
    }
    for (node, frames) in pending {
        let chain = node.chain();
        let mgr = node.version_manager();
        let block_pool = node.block_pool();
        let handle = node.start(Some(frames));
        nodes.push((handle, chain, mgr, block_pool));
    }

    // Eight one-second epochs of wall clock.
    tokio::time::sleep(Duration::from_secs(8)).await;

    for (handle, _, _, _) in &nodes {
        assert_eq!(
            handle.status(),
            triad_consensus::NodeStatus::Serving,
            "node never reached serving"
        );
    }

    let finalized: Vec<u64> = nodes.iter().map(|(_, c, _, _)| c.last_number()).collect();
    let shortest = *finalized.iter().min().unwrap();
    assert!(
        shortest >= 2,
        "expected at least 2 finalized blocks everywhere, got {:?}",
        finalized
    );

    // Safety: the finalized prefixes agree across every node.
    let reference = &nodes[0].1;
    for (_, chain, _, _) in &nodes {
        for number in 0..=shortest {
            assert_eq!(
                chain.block_by_number(number).unwrap().hash,
                reference.block_by_number(number).unwrap().hash,
                "finalized chains diverged at number {}",
                number
            );
        }
    }

    // Linkage and version hygiene. A handler may be mid-verification when
    // we sample, so allow one in-flight temp fork.
    for (_, chain, mgr, block_pool) in &nodes {
        for number in 1..=chain.last_number() {
            let block = chain.block_by_number(number).unwrap();
            let parent = chain.block_by_number(number - 1).unwrap();
            assert_eq!(block.last_hash, parent.hash);
        }
        let versions = mgr.num_versions();
        let live = block_pool.len();
        assert!(
            versions >= 1 && versions <= live + 2,
            "version leak: {} versions for {} live blocks",
            versions,
            live
        );
    }

    for (mut handle, _, _, _) in nodes {
        handle.stop();
    }
}
