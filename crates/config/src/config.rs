//! Main configuration module for Triad Core.
//!
//! All node settings are defined in one `triad.toml` file.

use crate::error::{ConfigError, ConfigResult};
use crate::genesis::GenesisConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Main configuration struct containing all Triad Core settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Chain identity and protocol versions
    #[serde(default)]
    pub chain: ChainConfig,

    /// Consensus parameters
    #[serde(default)]
    pub consensus: ConsensusConfig,

    /// P2P network parameters
    #[serde(default)]
    pub network: NetworkConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Lightweight-mode switches
    #[serde(default)]
    pub lightweight: LightweightConfig,

    /// Sharding / parent-chain reporting (optional)
    #[serde(default)]
    pub sharding: ShardingConfig,

    /// Genesis whitelist and stakes
    #[serde(default)]
    pub genesis: GenesisConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        info!("Loading configuration from {:?}", path);

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config = toml::from_str(&content)?;

        debug!("Configuration parsed, validating");
        config.validate()?;

        info!(
            chain_id = config.chain.chain_id,
            epoch_ms = config.consensus.epoch_ms,
            validators = config.genesis.validators.len(),
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section.
    pub fn validate(&self) -> ConfigResult<()> {
        self.chain.validate()?;
        self.consensus.validate()?;
        self.network.validate()?;
        self.logging.validate()?;
        self.sharding.validate()?;
        self.genesis.validate(self.consensus.min_num_validators)?;
        Ok(())
    }
}

/// Chain identity configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Chain identifier (prevents cross-chain replay)
    pub chain_id: u64,
    /// Wire protocol version advertised in every message envelope
    pub data_proto_ver: String,
    /// Consensus sub-protocol version carried in consensus messages
    pub consensus_proto_ver: String,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain_id: 1,
            data_proto_ver: "1.0.0".into(),
            consensus_proto_ver: "1.0.0".into(),
        }
    }
}

impl ChainConfig {
    fn validate(&self) -> ConfigResult<()> {
        if semver_parse(&self.data_proto_ver).is_none() {
            return Err(ConfigError::Invalid(format!(
                "data_proto_ver is not a semver: {}",
                self.data_proto_ver
            )));
        }
        if semver_parse(&self.consensus_proto_ver).is_none() {
            return Err(ConfigError::Invalid(format!(
                "consensus_proto_ver is not a semver: {}",
                self.consensus_proto_ver
            )));
        }
        Ok(())
    }
}

// Minimal major.minor.patch check; full semver handling lives in triad-p2p.
fn semver_parse(s: &str) -> Option<(u64, u64, u64)> {
    let mut parts = s.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

/// Consensus parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Epoch length in milliseconds
    pub epoch_ms: u64,
    /// Minimum number of whitelisted validators for proposals to be valid
    pub min_num_validators: usize,
    /// Consensus-state retention window: proposal N nulls out the record
    /// at N - max_consensus_states
    pub max_consensus_states: u64,
    /// How many epochs between clock-offset probes
    pub ntp_probe_interval_epochs: u64,
    /// Bound on the accumulated clock-offset correction, in milliseconds;
    /// each probe's delta and the running total are clamped to this
    pub max_time_adjustment_ms: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            epoch_ms: 20_000,
            min_num_validators: 3,
            max_consensus_states: 10,
            ntp_probe_interval_epochs: 100,
            max_time_adjustment_ms: 500,
        }
    }
}

impl ConsensusConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.epoch_ms < 1_000 {
            return Err(ConfigError::Invalid(format!(
                "epoch_ms must be at least 1000, got {}",
                self.epoch_ms
            )));
        }
        if self.min_num_validators == 0 {
            return Err(ConfigError::Invalid(
                "min_num_validators must be positive".into(),
            ));
        }
        if self.max_consensus_states == 0 {
            return Err(ConfigError::Invalid(
                "max_consensus_states must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// P2P network parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Maximum outbound peer connections
    pub max_outbound: usize,
    /// Maximum inbound peer connections
    pub max_inbound: usize,
    /// Acceptance window for message timestamps, in milliseconds
    pub message_window_ms: u64,
    /// Handshake timeout in milliseconds
    pub handshake_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_outbound: 8,
            max_inbound: 32,
            message_window_ms: 600_000,
            handshake_timeout_ms: 10_000,
        }
    }
}

impl NetworkConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.max_outbound == 0 {
            return Err(ConfigError::Invalid("max_outbound must be positive".into()));
        }
        if self.message_window_ms == 0 {
            return Err(ConfigError::Invalid(
                "message_window_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default tracing filter, e.g. `info` or `triad_consensus=debug,info`
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl LoggingConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.level.trim().is_empty() {
            return Err(ConfigError::Invalid("logging.level must not be empty".into()));
        }
        Ok(())
    }
}

/// Lightweight-mode switches.
///
/// These relax verification cost, never safety-critical vote accounting:
/// with `strict_state_proof` off, proposal verification skips the
/// state-proof-hash comparison and constructed blocks omit the proof hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LightweightConfig {
    /// Compare replayed state proof hashes against block headers
    pub strict_state_proof: bool,
    /// Enforce full rule evaluation for sharding proof-hash writes
    pub strict_sharding_rules: bool,
}

impl Default for LightweightConfig {
    fn default() -> Self {
        Self {
            strict_state_proof: true,
            strict_sharding_rules: true,
        }
    }
}

/// Sharding / parent-chain reporting configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ShardingConfig {
    /// JSON-RPC endpoint of the parent chain; `None` disables reporting
    pub parent_chain_endpoint: Option<String>,
    /// Path of this shard on the parent chain
    pub sharding_path: Option<String>,
    /// Report every N finalized blocks
    #[serde(default = "default_reporting_period")]
    pub reporting_period_blocks: u64,
}

fn default_reporting_period() -> u64 {
    10
}

impl ShardingConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.parent_chain_endpoint.is_some() && self.sharding_path.is_none() {
            return Err(ConfigError::Invalid(
                "sharding.parent_chain_endpoint requires sharding.sharding_path".into(),
            ));
        }
        if self.reporting_period_blocks == 0 {
            return Err(ConfigError::Invalid(
                "sharding.reporting_period_blocks must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Whether proof-hash reporting is enabled.
    pub fn reporting_enabled(&self) -> bool {
        self.parent_chain_endpoint.is_some()
    }
}
