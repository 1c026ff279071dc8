//! # Triad Core Config
//!
//! Single-config philosophy: every node setting lives in one `triad.toml`,
//! parsed into nested section structs that each validate themselves. The
//! genesis validator whitelist (addresses and stakes) is part of the same
//! file, so two nodes with the same config file agree on the genesis block.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod genesis;

pub use config::{
    ChainConfig, Config, ConsensusConfig, LightweightConfig, LoggingConfig, NetworkConfig,
    ShardingConfig,
};
pub use error::{ConfigError, ConfigResult};
pub use genesis::{GenesisConfig, GenesisValidator};
