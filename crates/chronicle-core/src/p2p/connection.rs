//! Peer connection lifecycle and signaling seam
//!
//! Signaling descriptions and ICE candidates are exchanged through a
//! caller-supplied out-of-band channel (copy-paste, QR code, relay —
//! the transport does not implement discovery). The core only needs an
//! object that can produce and consume serialized descriptions and,
//! once negotiation completes, hand over a bidirectional byte channel.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{SyncError, SyncResult};

/// Capacity of each direction of an in-memory data channel
const CHANNEL_CAPACITY: usize = 64;

/// Lifecycle of one peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No negotiation started
    Disconnected,
    /// We produced an offer and are waiting for the answer
    Offering,
    /// We received an offer and are producing the answer
    Answering,
    /// Data channel is open
    Connected,
    /// Connection was shut down or the peer went silent
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Offering => write!(f, "offering"),
            ConnectionState::Answering => write!(f, "answering"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Which side of the negotiation a description belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A serialized session description, opaque to the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    pub kind: SdpKind,
    /// The description payload, verbatim from the signaling layer
    pub sdp: String,
}

/// A serialized ICE candidate, opaque to the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate payload
    pub candidate: String,
    /// Media stream id the candidate belongs to, if any
    pub sdp_mid: Option<String>,
}

/// The established bidirectional data channel for one peer.
///
/// Frames are opaque byte blobs at this layer; encryption happens above.
pub struct PeerChannel {
    /// Outbound frames toward the peer
    pub tx: mpsc::Sender<Vec<u8>>,
    /// Inbound frames from the peer
    pub rx: mpsc::Receiver<Vec<u8>>,
}

/// Caller-supplied signaling for one peer connection.
///
/// The implementation owns the actual negotiation (WebRTC, relay, or an
/// in-process link); the transport drives it through this surface and
/// collects the data channel once the link is up.
#[async_trait]
pub trait Signaling: Send + Sync {
    /// Produce the local offer to be relayed out of band.
    async fn create_offer(&self) -> SyncResult<SessionDescription>;

    /// Consume a remote offer and produce the local answer.
    async fn create_answer(&self, remote: SessionDescription) -> SyncResult<SessionDescription>;

    /// Apply the remote answer on the offering side.
    async fn set_remote_description(&self, remote: SessionDescription) -> SyncResult<()>;

    /// Apply a trickled ICE candidate.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> SyncResult<()>;

    /// Wait for negotiation to finish and take the data channel.
    ///
    /// Errors if negotiation has not completed or the channel was
    /// already taken.
    async fn wait_connected(&self) -> SyncResult<PeerChannel>;
}

/// Shared state of a linked in-memory signaling pair.
struct MemoryLink {
    negotiated: Mutex<bool>,
}

/// In-process signaling: two linked endpoints with a duplex channel.
///
/// Stands in for a real signaling layer in tests and single-process
/// setups; the offer/answer payloads are placeholders, but the ordering
/// contract is enforced so the transport's state machine is exercised.
pub struct MemorySignaling {
    link: Arc<MemoryLink>,
    channel: Mutex<Option<PeerChannel>>,
}

impl MemorySignaling {
    /// Create a linked pair of signaling endpoints.
    pub fn pair() -> (MemorySignaling, MemorySignaling) {
        let (a_tx, b_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (b_tx, a_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let link = Arc::new(MemoryLink {
            negotiated: Mutex::new(false),
        });

        let a = MemorySignaling {
            link: link.clone(),
            channel: Mutex::new(Some(PeerChannel { tx: a_tx, rx: a_rx })),
        };
        let b = MemorySignaling {
            link,
            channel: Mutex::new(Some(PeerChannel { tx: b_tx, rx: b_rx })),
        };
        (a, b)
    }
}

#[async_trait]
impl Signaling for MemorySignaling {
    async fn create_offer(&self) -> SyncResult<SessionDescription> {
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: "memory-offer".to_string(),
        })
    }

    async fn create_answer(&self, remote: SessionDescription) -> SyncResult<SessionDescription> {
        if remote.kind != SdpKind::Offer {
            return Err(SyncError::Channel(
                "create_answer expects an offer".to_string(),
            ));
        }
        *self.link.negotiated.lock() = true;
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: "memory-answer".to_string(),
        })
    }

    async fn set_remote_description(&self, remote: SessionDescription) -> SyncResult<()> {
        if remote.kind != SdpKind::Answer {
            return Err(SyncError::Channel(
                "set_remote_description expects an answer".to_string(),
            ));
        }
        *self.link.negotiated.lock() = true;
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> SyncResult<()> {
        // The in-memory link has no network path to negotiate
        Ok(())
    }

    async fn wait_connected(&self) -> SyncResult<PeerChannel> {
        if !*self.link.negotiated.lock() {
            return Err(SyncError::Channel(
                "signaling handshake not completed".to_string(),
            ));
        }
        self.channel
            .lock()
            .take()
            .ok_or_else(|| SyncError::Channel("data channel already taken".to_string()))
    }
}
