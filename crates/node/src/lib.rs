//! # Triad Core Node
//!
//! The full node: loads the single TOML config, bootstraps the genesis
//! state, wires the state database, transaction pool, chain log, consensus
//! engine and peer dispatcher together, and runs their event loops. The
//! cross-chain proof-hash reporter hangs off the finalization events
//! behind the [`ShardReporter`] seam.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod node;
pub mod reporter;

pub use node::{Node, NodeHandle};
pub use reporter::{NoopReporter, ProofHashReporter, ReporterError, ShardReporter};
