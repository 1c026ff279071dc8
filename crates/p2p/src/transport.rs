//! The duplex transport seam.
//!
//! The dispatcher talks to peers through [`PeerTransport`]; the embedding
//! process decides what actually carries the frames. [`ChannelNetwork`]
//! wires transports together over tokio channels for tests and
//! single-process clusters.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

/// Identifies one peer connection. For the channel transport this is the
/// peer's node id; a socket transport would use its remote endpoint.
pub type PeerId = String;

/// Errors from the transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer is not connected
    #[error("peer not connected: {0}")]
    PeerNotConnected(PeerId),

    /// The frame could not be delivered
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Result type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// A duplex, message-oriented transport to a set of peers.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// This node's own peer id.
    fn local_id(&self) -> PeerId;

    /// Sends a frame to every connected peer.
    async fn broadcast(&self, frame: String) -> TransportResult<()>;

    /// Sends a frame to one peer.
    async fn send(&self, peer: &PeerId, frame: String) -> TransportResult<()>;

    /// Currently connected peers.
    fn peers(&self) -> Vec<PeerId>;

    /// Drops a peer connection (version gate failures on handshakes).
    fn disconnect(&self, peer: &PeerId);
}

type FrameSender = mpsc::UnboundedSender<(PeerId, String)>;

/// An in-memory hub connecting [`ChannelTransport`]s.
#[derive(Default)]
pub struct ChannelNetwork {
    inboxes: RwLock<HashMap<PeerId, FrameSender>>,
}

impl ChannelNetwork {
    /// Creates an empty hub.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Joins the hub under `id`. Returns the transport handle and the
    /// stream of `(from, frame)` pairs addressed to this node.
    pub fn join(
        self: &Arc<Self>,
        id: impl Into<PeerId>,
    ) -> (ChannelTransport, mpsc::UnboundedReceiver<(PeerId, String)>) {
        let id = id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.write().insert(id.clone(), tx);
        (
            ChannelTransport {
                id,
                network: Arc::clone(self),
            },
            rx,
        )
    }

    /// Removes a node from the hub.
    pub fn leave(&self, id: &PeerId) {
        self.inboxes.write().remove(id);
    }

    fn deliver(&self, from: &PeerId, to: &PeerId, frame: String) -> TransportResult<()> {
        let inboxes = self.inboxes.read();
        let sender = inboxes
            .get(to)
            .ok_or_else(|| TransportError::PeerNotConnected(to.clone()))?;
        sender
            .send((from.clone(), frame))
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn members_except(&self, id: &PeerId) -> Vec<PeerId> {
        self.inboxes
            .read()
            .keys()
            .filter(|k| *k != id)
            .cloned()
            .collect()
    }
}

/// A transport backed by a [`ChannelNetwork`].
pub struct ChannelTransport {
    id: PeerId,
    network: Arc<ChannelNetwork>,
}

#[async_trait]
impl PeerTransport for ChannelTransport {
    fn local_id(&self) -> PeerId {
        self.id.clone()
    }

    async fn broadcast(&self, frame: String) -> TransportResult<()> {
        for peer in self.network.members_except(&self.id) {
            if let Err(e) = self.network.deliver(&self.id, &peer, frame.clone()) {
                trace!(peer = %peer, error = %e, "broadcast delivery failed");
            }
        }
        Ok(())
    }

    async fn send(&self, peer: &PeerId, frame: String) -> TransportResult<()> {
        self.network.deliver(&self.id, peer, frame)
    }

    fn peers(&self) -> Vec<PeerId> {
        self.network.members_except(&self.id)
    }

    fn disconnect(&self, peer: &PeerId) {
        // The hub models a fully connected mesh; dropping a peer here only
        // makes sense node-locally, so it is a no-op.
        trace!(peer = %peer, "disconnect requested on channel transport");
    }
}
