//! # Triad Core P2P
//!
//! The peer wire protocol and message dispatch:
//!
//! - [`message`] - the JSON envelope and the six message kinds, parsed once
//!   and dispatched by match
//! - [`transport`] - the duplex transport seam ([`PeerTransport`]) plus an
//!   in-memory channel implementation for tests and local clusters
//! - [`dispatcher`] - handshake, version gating, timestamp windows and
//!   routing into the node's channels
//!
//! The real socket layer (WebSocket framing, tracker discovery) lives
//! behind the transport trait and is provided by the embedding process.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod dispatcher;
pub mod message;
pub mod transport;

pub use dispatcher::{DispatchEvent, DispatcherConfig, PeerDispatcher};
pub use message::{
    ChainSegmentRequest, ChainSegmentResponse, ConsensusWire, Envelope, Handshake, HandshakeBody,
    Message, MessageKind, TransactionPayload, TxOrList,
};
pub use transport::{
    ChannelNetwork, ChannelTransport, PeerId, PeerTransport, TransportError, TransportResult,
};

/// Result type alias for p2p operations
pub type Result<T> = std::result::Result<T, P2pError>;

/// Errors that can occur in the p2p layer
#[derive(Debug, thiserror::Error)]
pub enum P2pError {
    /// The message is not valid JSON or misses required fields
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The sender speaks an incompatible protocol major version
    #[error("incompatible protocol version: {0}")]
    VersionIncompatible(String),

    /// The message timestamp is outside the acceptance window
    #[error("stale message: {0}")]
    Stale(String),

    /// A handshake signature did not recover to the claimed address
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The node-side channel is gone
    #[error("dispatch channel closed")]
    ChannelClosed,
}
