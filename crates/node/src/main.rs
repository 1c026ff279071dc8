//! Triad Core node binary.
//!
//! Usage: `triad-node [path/to/triad.toml]`
//!
//! The validator key comes from `TRIAD_NODE_KEY` (hex); without it an
//! ephemeral key is generated, which is only useful for local trials. The
//! socket transport is provided by the embedding deployment; standalone,
//! the binary runs on an empty in-process transport and single-validator
//! configurations can finalize on their own.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use triad_config::Config;
use triad_crypto::PrivateKey;
use triad_node::Node;
use triad_p2p::ChannelNetwork;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "triad.toml".to_string());
    let config = Config::load(Path::new(&config_path))
        .with_context(|| format!("loading {}", config_path))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone())),
        )
        .init();

    let key = match std::env::var("TRIAD_NODE_KEY") {
        Ok(hex) => PrivateKey::from_hex(&hex).context("parsing TRIAD_NODE_KEY")?,
        Err(_) => {
            let key = PrivateKey::random();
            info!("TRIAD_NODE_KEY not set; generated an ephemeral key");
            key
        }
    };
    info!(address = %triad_types::Address::from(key.address()), "validator identity");

    let network = ChannelNetwork::new();
    let (transport, frames) = network.join("local");
    let node = Node::build(config, key, Arc::new(transport))?;
    let mut handle = node.start(Some(frames));

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    handle.stop();
    Ok(())
}
