//! The cross-chain proof-hash reporter.
//!
//! When this chain runs as a shard, every `reporting_period_blocks`-th
//! finalized block has its state proof hash written to the parent chain at
//! `/<sharding_path>/shard/proof_hash_map/<N>/proof_hash`. The JSON-RPC
//! plumbing that actually reaches the parent chain is an external
//! collaborator behind [`ShardReporter`]; failures are logged and retried
//! at the next reporting period.

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use triad_config::ShardingConfig;
use triad_crypto::PrivateKey;
use triad_types::{Block, Operation, TxBody};

/// Errors from the reporting collaborator.
#[derive(Debug, Error)]
pub enum ReporterError {
    /// The parent chain could not be reached
    #[error("parent chain unreachable: {0}")]
    Unreachable(String),

    /// The parent chain rejected the report
    #[error("report rejected: {0}")]
    Rejected(String),
}

/// The collaborator seam toward the parent chain.
#[async_trait]
pub trait ShardReporter: Send + Sync {
    /// Sends a transaction body to the parent chain and waits until it is
    /// finalized there.
    async fn send_and_wait_finalized(
        &self,
        endpoint: &str,
        tx_body: TxBody,
        key: &PrivateKey,
    ) -> Result<(), ReporterError>;
}

/// A reporter that discards reports; used when the node is not a shard.
#[derive(Debug, Default)]
pub struct NoopReporter;

#[async_trait]
impl ShardReporter for NoopReporter {
    async fn send_and_wait_finalized(
        &self,
        _endpoint: &str,
        _tx_body: TxBody,
        _key: &PrivateKey,
    ) -> Result<(), ReporterError> {
        Ok(())
    }
}

/// Drives periodic proof-hash reports from finalization events.
pub struct ProofHashReporter {
    config: ShardingConfig,
    key: PrivateKey,
    reporter: Box<dyn ShardReporter>,
}

impl ProofHashReporter {
    /// Creates a reporter bound to the node's sharding configuration.
    pub fn new(config: ShardingConfig, key: PrivateKey, reporter: Box<dyn ShardReporter>) -> Self {
        Self {
            config,
            key,
            reporter,
        }
    }

    /// Called for every finalized block; reports when the block number
    /// lands on the reporting period. Errors are logged, never propagated -
    /// the next period retries.
    pub async fn on_finalized(&self, block: &Block, timestamp: u64) {
        if !self.config.reporting_enabled() {
            return;
        }
        if block.number == 0 || block.number % self.config.reporting_period_blocks != 0 {
            return;
        }
        let (endpoint, path) = match (
            self.config.parent_chain_endpoint.as_deref(),
            self.config.sharding_path.as_deref(),
        ) {
            (Some(endpoint), Some(path)) => (endpoint, path),
            _ => return,
        };
        let proof_hash = match block.state_proof_hash {
            Some(hash) => hash,
            None => {
                debug!(number = block.number, "no proof hash to report in lightweight mode");
                return;
            }
        };

        let ref_path = format!(
            "{}/shard/proof_hash_map/{}/proof_hash",
            path.trim_end_matches('/'),
            block.number
        );
        let body = TxBody::unordered(
            Operation::set_value(ref_path, json!(proof_hash.to_hex())),
            timestamp,
        );
        match self
            .reporter
            .send_and_wait_finalized(endpoint, body, &self.key)
            .await
        {
            Ok(()) => info!(number = block.number, "reported proof hash to parent chain"),
            Err(e) => warn!(number = block.number, error = %e, "proof hash report failed; will retry next period"),
        }
    }
}
