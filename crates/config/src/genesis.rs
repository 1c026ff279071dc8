//! Genesis configuration: the validator whitelist and initial stakes.

use crate::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use triad_types::{Address, Stake};

/// A single genesis validator entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisValidator {
    /// Validator address (0x-prefixed hex)
    pub address: Address,
    /// Initial consensus stake
    pub stake: Stake,
}

/// Genesis configuration.
///
/// Two nodes sharing this section derive byte-identical genesis blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenesisConfig {
    /// Fixed genesis timestamp in milliseconds; also anchors the epoch clock
    pub timestamp: u64,
    /// Whitelisted validators with their stakes
    pub validators: Vec<GenesisValidator>,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            timestamp: 1_700_000_000_000,
            validators: Vec::new(),
        }
    }
}

impl GenesisConfig {
    /// Validate the genesis section against the consensus minimum.
    pub fn validate(&self, min_num_validators: usize) -> ConfigResult<()> {
        if self.timestamp == 0 {
            return Err(ConfigError::InvalidGenesis("timestamp must be set".into()));
        }
        if self.validators.len() < min_num_validators {
            return Err(ConfigError::InvalidGenesis(format!(
                "{} validators configured, minimum is {}",
                self.validators.len(),
                min_num_validators
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for v in &self.validators {
            if v.stake == 0 {
                return Err(ConfigError::InvalidGenesis(format!(
                    "validator {} has zero stake",
                    v.address
                )));
            }
            if !seen.insert(v.address) {
                return Err(ConfigError::InvalidGenesis(format!(
                    "duplicate validator {}",
                    v.address
                )));
            }
        }
        Ok(())
    }

    /// The whitelist as an ordered stake map, the shape the genesis block
    /// and the consensus engine consume.
    pub fn whitelist(&self) -> BTreeMap<Address, Stake> {
        self.validators
            .iter()
            .map(|v| (v.address, v.stake))
            .collect()
    }

    /// Total stake across the whitelist.
    pub fn total_stake(&self) -> Stake {
        self.validators.iter().map(|v| v.stake).sum()
    }
}
