//! The peer dispatcher: handshakes, gating, routing.
//!
//! Every inbound frame passes three gates before its payload is routed:
//! shape (valid JSON envelope), version (`dataProtoVer` must share our
//! major), and freshness (timestamp inside the acceptance window). A
//! version failure on a handshake message closes the connection; on any
//! other kind the frame is dropped silently. Nothing on this path
//! propagates an error to the socket loop - offenders are logged and
//! dropped.

use parking_lot::RwLock;
use semver::Version;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use triad_consensus::{CatchUpEntry, ConsensusMessage};
use triad_crypto::PrivateKey;
use triad_types::{Address, Block, Transaction};

use crate::message::{
    ChainSegmentRequest, ChainSegmentResponse, ConsensusWire, Envelope, Handshake, Message,
    MessageKind, TransactionPayload, TxOrList,
};
use crate::transport::{PeerId, PeerTransport};
use crate::{P2pError, Result};

/// Dispatcher settings, lifted from the node configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Our wire protocol version, advertised on every envelope
    pub data_proto_ver: String,
    /// Our consensus sub-protocol version
    pub consensus_proto_ver: String,
    /// Acceptance window for message timestamps, in milliseconds
    pub message_window_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            data_proto_ver: "1.0.0".into(),
            consensus_proto_ver: "1.0.0".into(),
            message_window_ms: 600_000,
        }
    }
}

/// Payloads routed from peers into the node.
#[derive(Debug)]
pub enum DispatchEvent {
    /// A peer completed its handshake
    PeerReady {
        /// Transport-level peer id
        peer: PeerId,
        /// The address the peer proved
        address: Address,
    },
    /// A verified-shape consensus message (verification proper happens in
    /// the engine)
    Consensus(ConsensusMessage),
    /// Transactions for the pool
    Transactions(Vec<Transaction>),
    /// A peer asks for blocks past its tip
    SegmentRequest {
        /// Who asked
        peer: PeerId,
        /// The requester's tip
        last_block: Option<Block>,
    },
    /// A peer served us blocks and pool fragments
    SegmentResponse {
        /// Served blocks, possibly empty
        chain_segment: Vec<Block>,
        /// The sender's finalized tip number
        number: u64,
        /// Pool fragments
        catch_up_info: Vec<CatchUpEntry>,
    },
}

/// The peer dispatcher.
pub struct PeerDispatcher {
    config: DispatcherConfig,
    our_major: u64,
    key: PrivateKey,
    transport: Arc<dyn PeerTransport>,
    handshaked: RwLock<HashMap<PeerId, Address>>,
    events: mpsc::Sender<DispatchEvent>,
    clock: Arc<dyn Fn() -> u64 + Send + Sync>,
}

impl PeerDispatcher {
    /// Creates a dispatcher. `clock` supplies unix milliseconds; inject a
    /// manual clock in tests.
    pub fn new(
        config: DispatcherConfig,
        key: PrivateKey,
        transport: Arc<dyn PeerTransport>,
        events: mpsc::Sender<DispatchEvent>,
        clock: Arc<dyn Fn() -> u64 + Send + Sync>,
    ) -> Result<Self> {
        let our_major = Version::parse(&config.data_proto_ver)
            .map_err(|e| P2pError::Malformed(format!("own dataProtoVer invalid: {}", e)))?
            .major;
        Ok(Self {
            config,
            our_major,
            key,
            transport,
            handshaked: RwLock::new(HashMap::new()),
            events,
            clock,
        })
    }

    /// Addresses of peers that completed their handshake.
    pub fn ready_peers(&self) -> Vec<(PeerId, Address)> {
        self.handshaked
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    /// Initiates the handshake with a freshly connected peer.
    pub async fn greet(&self, peer: &PeerId) -> Result<()> {
        let handshake = Handshake::sign(&self.key, (self.clock)())?;
        let frame = self.frame(Message::AddressRequest(handshake))?;
        self.transport.send(peer, frame).await?;
        Ok(())
    }

    /// Initiates handshakes with every connected peer.
    pub async fn greet_all(&self) {
        for peer in self.transport.peers() {
            if let Err(e) = self.greet(&peer).await {
                debug!(peer = %peer, error = %e, "greeting failed");
            }
        }
    }

    /// Number of transport-level peer connections.
    pub fn peer_count(&self) -> usize {
        self.transport.peers().len()
    }

    /// Handles one inbound frame. Errors are for the caller's logs only;
    /// the dispatcher has already taken any protective action (dropping the
    /// frame, closing the connection).
    pub async fn handle_frame(&self, from: PeerId, frame: &str) -> Result<()> {
        let envelope = Envelope::from_frame(frame)?;
        self.gate(&from, &envelope)?;
        let message = envelope.parse()?;

        match message {
            Message::AddressRequest(handshake) => {
                self.accept_handshake(&from, handshake).await?;
                let reply = Handshake::sign(&self.key, (self.clock)())?;
                let frame = self.frame(Message::AddressResponse(reply))?;
                self.transport.send(&from, frame).await?;
                Ok(())
            }
            Message::AddressResponse(handshake) => self.accept_handshake(&from, handshake).await,
            Message::Consensus(wire) => {
                self.require_ready(&from)?;
                let msg = match wire {
                    ConsensusWire::Propose {
                        block, proposal_tx, ..
                    } => ConsensusMessage::Proposal { block, proposal_tx },
                    ConsensusWire::Vote { vote_tx, .. } => ConsensusMessage::Vote { vote_tx },
                };
                self.emit(DispatchEvent::Consensus(msg)).await
            }
            Message::Transaction(payload) => {
                self.require_ready(&from)?;
                self.emit(DispatchEvent::Transactions(payload.into_transactions()))
                    .await
            }
            Message::ChainSegmentRequest(request) => {
                // Segment exchange is open to peers that have not completed
                // a handshake: syncing nodes need it before serving.
                self.emit(DispatchEvent::SegmentRequest {
                    peer: from,
                    last_block: request.last_block,
                })
                .await
            }
            Message::ChainSegmentResponse(response) => {
                self.emit(DispatchEvent::SegmentResponse {
                    chain_segment: response.chain_segment.unwrap_or_default(),
                    number: response.number,
                    catch_up_info: response.catch_up_info.unwrap_or_default(),
                })
                .await
            }
        }
    }

    /// Broadcasts a consensus message to all peers.
    pub async fn broadcast_consensus(&self, message: ConsensusMessage) -> Result<()> {
        let wire = match message {
            ConsensusMessage::Proposal { block, proposal_tx } => ConsensusWire::Propose {
                block,
                proposal_tx,
                consensus_proto_ver: self.config.consensus_proto_ver.clone(),
            },
            ConsensusMessage::Vote { vote_tx } => ConsensusWire::Vote {
                vote_tx,
                consensus_proto_ver: self.config.consensus_proto_ver.clone(),
            },
        };
        let frame = self.frame(Message::Consensus(wire))?;
        self.transport.broadcast(frame).await?;
        Ok(())
    }

    /// Asks every peer for chain segments past our tip.
    pub async fn request_chain_segments(&self, last_block: Block) -> Result<()> {
        let frame = self.frame(Message::ChainSegmentRequest(ChainSegmentRequest {
            last_block: Some(last_block),
        }))?;
        for peer in self.transport.peers() {
            if let Err(e) = self.transport.send(&peer, frame.clone()).await {
                debug!(peer = %peer, error = %e, "segment request not delivered");
            }
        }
        Ok(())
    }

    /// Serves a chain segment to one peer.
    pub async fn send_chain_segment(
        &self,
        peer: &PeerId,
        segment: Vec<Block>,
        number: u64,
        catch_up_info: Vec<CatchUpEntry>,
    ) -> Result<()> {
        let response = ChainSegmentResponse {
            chain_segment: if segment.is_empty() {
                None
            } else {
                Some(segment)
            },
            number,
            catch_up_info: if catch_up_info.is_empty() {
                None
            } else {
                Some(catch_up_info)
            },
        };
        let frame = self.frame(Message::ChainSegmentResponse(response))?;
        self.transport.send(peer, frame).await?;
        Ok(())
    }

    /// Forwards a transaction batch to all peers.
    pub async fn broadcast_transactions(&self, txs: Vec<Transaction>) -> Result<()> {
        let payload = if txs.len() == 1 {
            TxOrList::Single(Box::new(txs.into_iter().next().expect("len checked")))
        } else {
            TxOrList::List { tx_list: txs }
        };
        let frame = self.frame(Message::Transaction(TransactionPayload {
            transaction: payload,
        }))?;
        self.transport.broadcast(frame).await?;
        Ok(())
    }

    fn frame(&self, message: Message) -> Result<String> {
        message
            .into_envelope(&self.config.data_proto_ver, (self.clock)())?
            .to_frame()
    }

    /// Version and freshness gates. Handshake kinds close the connection
    /// on a version failure; everything else drops silently.
    fn gate(&self, from: &PeerId, envelope: &Envelope) -> Result<()> {
        let version_ok = Version::parse(&envelope.data_proto_ver)
            .map(|v| v.major == self.our_major)
            .unwrap_or(false);
        if !version_ok {
            if Message::is_handshake_kind(envelope.kind) {
                warn!(peer = %from, ver = %envelope.data_proto_ver, "closing peer with incompatible version");
                self.transport.disconnect(from);
                self.handshaked.write().remove(from);
            } else {
                trace!(peer = %from, ver = %envelope.data_proto_ver, "dropping frame with incompatible version");
            }
            return Err(P2pError::VersionIncompatible(
                envelope.data_proto_ver.clone(),
            ));
        }

        let now = (self.clock)();
        let window = self.config.message_window_ms;
        let fresh =
            envelope.timestamp + window >= now && envelope.timestamp <= now + window;
        if !fresh {
            return Err(P2pError::Stale(format!(
                "timestamp {} outside window around {}",
                envelope.timestamp, now
            )));
        }
        Ok(())
    }

    async fn accept_handshake(&self, from: &PeerId, handshake: Handshake) -> Result<()> {
        if let Err(e) = handshake.verify() {
            warn!(peer = %from, error = %e, "closing peer with bad handshake");
            self.transport.disconnect(from);
            return Err(e);
        }
        let address = handshake.body.address;
        let known = self
            .handshaked
            .write()
            .insert(from.clone(), address)
            .is_some();
        if !known {
            info!(peer = %from, address = %address, "peer handshake complete");
            self.emit(DispatchEvent::PeerReady {
                peer: from.clone(),
                address,
            })
            .await?;
        }
        Ok(())
    }

    fn require_ready(&self, from: &PeerId) -> Result<()> {
        if self.handshaked.read().contains_key(from) {
            Ok(())
        } else {
            Err(P2pError::Unauthorized(format!(
                "message from peer {} before handshake",
                from
            )))
        }
    }

    async fn emit(&self, event: DispatchEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| P2pError::ChannelClosed)
    }
}
