//! The wire protocol: a JSON envelope over six message kinds.
//!
//! Envelope shape:
//!
//! ```json
//! { "type": "...", "dataProtoVer": "1.0.0", "timestamp": 1700000000000, "data": { ... } }
//! ```
//!
//! Frames are parsed once into [`Message`] and dispatched by match.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use triad_consensus::CatchUpEntry;
use triad_crypto::{PrivateKey, Signature};
use triad_types::{Address, Block, Transaction};

use crate::{P2pError, Result};

/// The six wire message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Handshake: peer announces its address, signed
    #[serde(rename = "ADDRESS_REQUEST")]
    AddressRequest,
    /// Handshake reply, same shape
    #[serde(rename = "ADDRESS_RESPONSE")]
    AddressResponse,
    /// A consensus proposal or vote
    #[serde(rename = "CONSENSUS")]
    Consensus,
    /// One transaction or a batch
    #[serde(rename = "TRANSACTION")]
    Transaction,
    /// Catch-up: send me blocks past my tip
    #[serde(rename = "CHAIN_SEGMENT_REQUEST")]
    ChainSegmentRequest,
    /// Catch-up reply: blocks plus pool fragments
    #[serde(rename = "CHAIN_SEGMENT_RESPONSE")]
    ChainSegmentResponse,
}

/// The raw envelope as it travels on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Message kind
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Sender's wire protocol version
    #[serde(rename = "dataProtoVer")]
    pub data_proto_ver: String,
    /// Send time in unix milliseconds
    pub timestamp: u64,
    /// Kind-specific payload
    pub data: Value,
}

impl Envelope {
    /// Serializes the envelope to its wire frame.
    pub fn to_frame(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| P2pError::Malformed(e.to_string()))
    }

    /// Parses a wire frame. The version and timestamp gates live in the
    /// dispatcher; this only checks shape.
    pub fn from_frame(frame: &str) -> Result<Self> {
        serde_json::from_str(frame).map_err(|e| P2pError::Malformed(e.to_string()))
    }

    /// Parses the payload into its typed message.
    pub fn parse(&self) -> Result<Message> {
        let data = self.data.clone();
        let message = match self.kind {
            MessageKind::AddressRequest => Message::AddressRequest(from_value(data)?),
            MessageKind::AddressResponse => Message::AddressResponse(from_value(data)?),
            MessageKind::Consensus => {
                let payload: ConsensusPayload = from_value(data)?;
                Message::Consensus(payload.message)
            }
            MessageKind::Transaction => Message::Transaction(from_value(data)?),
            MessageKind::ChainSegmentRequest => Message::ChainSegmentRequest(from_value(data)?),
            MessageKind::ChainSegmentResponse => Message::ChainSegmentResponse(from_value(data)?),
        };
        Ok(message)
    }
}

fn from_value<T: serde::de::DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| P2pError::Malformed(e.to_string()))
}

/// A parsed wire message.
#[derive(Debug, Clone)]
pub enum Message {
    /// Handshake request
    AddressRequest(Handshake),
    /// Handshake reply
    AddressResponse(Handshake),
    /// A consensus proposal or vote
    Consensus(ConsensusWire),
    /// One transaction or a batch
    Transaction(TransactionPayload),
    /// Catch-up request carrying the requester's tip
    ChainSegmentRequest(ChainSegmentRequest),
    /// Catch-up reply
    ChainSegmentResponse(ChainSegmentResponse),
}

impl Message {
    /// The wire kind of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::AddressRequest(_) => MessageKind::AddressRequest,
            Message::AddressResponse(_) => MessageKind::AddressResponse,
            Message::Consensus(_) => MessageKind::Consensus,
            Message::Transaction(_) => MessageKind::Transaction,
            Message::ChainSegmentRequest(_) => MessageKind::ChainSegmentRequest,
            Message::ChainSegmentResponse(_) => MessageKind::ChainSegmentResponse,
        }
    }

    /// Whether this kind belongs to the handshake phase; version failures
    /// on these close the connection instead of dropping silently.
    pub fn is_handshake_kind(kind: MessageKind) -> bool {
        matches!(
            kind,
            MessageKind::AddressRequest | MessageKind::AddressResponse
        )
    }

    /// Wraps the message into an envelope.
    pub fn into_envelope(self, data_proto_ver: &str, timestamp: u64) -> Result<Envelope> {
        let kind = self.kind();
        let data = match self {
            Message::AddressRequest(h) | Message::AddressResponse(h) => to_value(&h)?,
            Message::Consensus(message) => to_value(&ConsensusPayload { message })?,
            Message::Transaction(t) => to_value(&t)?,
            Message::ChainSegmentRequest(r) => to_value(&r)?,
            Message::ChainSegmentResponse(r) => to_value(&r)?,
        };
        Ok(Envelope {
            kind,
            data_proto_ver: data_proto_ver.to_string(),
            timestamp,
            data,
        })
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| P2pError::Malformed(e.to_string()))
}

/// The signed body of a handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeBody {
    /// The address the peer claims
    pub address: Address,
    /// Signing time in unix milliseconds
    pub timestamp: u64,
}

/// A handshake message: body plus a signature that must recover to
/// `body.address`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handshake {
    /// The signed body
    pub body: HandshakeBody,
    /// Recoverable signature over the body's canonical JSON
    pub signature: Signature,
}

impl Handshake {
    /// Signs a handshake for the given key.
    pub fn sign(key: &PrivateKey, timestamp: u64) -> Result<Self> {
        let body = HandshakeBody {
            address: Address::from(key.address()),
            timestamp,
        };
        let bytes = serde_json::to_vec(&body).map_err(|e| P2pError::Malformed(e.to_string()))?;
        let signature = key
            .sign(&bytes)
            .map_err(|e| P2pError::Unauthorized(e.to_string()))?;
        Ok(Self { body, signature })
    }

    /// Verifies that the signature recovers to the claimed address.
    pub fn verify(&self) -> Result<()> {
        let bytes =
            serde_json::to_vec(&self.body).map_err(|e| P2pError::Malformed(e.to_string()))?;
        let recovered = self
            .signature
            .recover(&bytes)
            .map_err(|e| P2pError::Unauthorized(e.to_string()))?;
        if Address::from(recovered) != self.body.address {
            return Err(P2pError::Unauthorized(format!(
                "handshake signature recovers to {}, claimed {}",
                Address::from(recovered),
                self.body.address
            )));
        }
        Ok(())
    }
}

/// The `data` payload of a CONSENSUS envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConsensusPayload {
    message: ConsensusWire,
}

/// A consensus sub-message: `{ type, value, consensusProtoVer }`.
#[derive(Debug, Clone)]
pub enum ConsensusWire {
    /// A block proposal
    Propose {
        /// The proposed block
        block: Block,
        /// Its proposal transaction
        proposal_tx: Transaction,
        /// Consensus sub-protocol version
        consensus_proto_ver: String,
    },
    /// A validator vote
    Vote {
        /// The vote transaction
        vote_tx: Transaction,
        /// Consensus sub-protocol version
        consensus_proto_ver: String,
    },
}

#[derive(Serialize, Deserialize)]
struct ConsensusWireRaw {
    #[serde(rename = "type")]
    kind: String,
    value: Value,
    #[serde(rename = "consensusProtoVer")]
    consensus_proto_ver: String,
}

#[derive(Serialize, Deserialize)]
struct ProposeValue {
    block: Block,
    proposal_tx: Transaction,
}

impl Serialize for ConsensusWire {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        let raw = match self {
            ConsensusWire::Propose {
                block,
                proposal_tx,
                consensus_proto_ver,
            } => ConsensusWireRaw {
                kind: "PROPOSE".into(),
                value: serde_json::to_value(ProposeValue {
                    block: block.clone(),
                    proposal_tx: proposal_tx.clone(),
                })
                .map_err(serde::ser::Error::custom)?,
                consensus_proto_ver: consensus_proto_ver.clone(),
            },
            ConsensusWire::Vote {
                vote_tx,
                consensus_proto_ver,
            } => ConsensusWireRaw {
                kind: "VOTE".into(),
                value: serde_json::to_value(vote_tx).map_err(serde::ser::Error::custom)?,
                consensus_proto_ver: consensus_proto_ver.clone(),
            },
        };
        raw.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ConsensusWire {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let raw = ConsensusWireRaw::deserialize(deserializer)?;
        match raw.kind.as_str() {
            "PROPOSE" => {
                let value: ProposeValue =
                    serde_json::from_value(raw.value).map_err(serde::de::Error::custom)?;
                Ok(ConsensusWire::Propose {
                    block: value.block,
                    proposal_tx: value.proposal_tx,
                    consensus_proto_ver: raw.consensus_proto_ver,
                })
            }
            "VOTE" => {
                let vote_tx: Transaction =
                    serde_json::from_value(raw.value).map_err(serde::de::Error::custom)?;
                Ok(ConsensusWire::Vote {
                    vote_tx,
                    consensus_proto_ver: raw.consensus_proto_ver,
                })
            }
            other => Err(serde::de::Error::custom(format!(
                "unknown consensus message type: {}",
                other
            ))),
        }
    }
}

/// The `data` payload of a TRANSACTION envelope: one transaction or a list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionPayload {
    /// The transaction or batch
    pub transaction: TxOrList,
}

/// One transaction or `{ "tx_list": [...] }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TxOrList {
    /// A batch of transactions
    List {
        /// The batch, applied in order
        tx_list: Vec<Transaction>,
    },
    /// A single transaction
    Single(Box<Transaction>),
}

impl TransactionPayload {
    /// Flattens the payload into a list.
    pub fn into_transactions(self) -> Vec<Transaction> {
        match self.transaction {
            TxOrList::Single(tx) => vec![*tx],
            TxOrList::List { tx_list } => tx_list,
        }
    }
}

/// The `data` payload of a CHAIN_SEGMENT_REQUEST envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSegmentRequest {
    /// The requester's finalized tip, or `None` from a fresh node
    #[serde(rename = "lastBlock")]
    pub last_block: Option<Block>,
}

/// The `data` payload of a CHAIN_SEGMENT_RESPONSE envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSegmentResponse {
    /// Blocks right after the requester's tip, or `None` when none help
    #[serde(rename = "chainSegment")]
    pub chain_segment: Option<Vec<Block>>,
    /// The sender's finalized tip number
    pub number: u64,
    /// Pool fragments for DAG reconstruction
    #[serde(rename = "catchUpInfo")]
    pub catch_up_info: Option<Vec<CatchUpEntry>>,
}
