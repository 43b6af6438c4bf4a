//! Peer channel message protocol
//!
//! Messages are serialized with postcard, encrypted with the channel
//! key, and carried as `{iv, ciphertext}` frames. Channel encryption is
//! independent of record-level encryption: `History` and `SyncResponse`
//! payloads carry records that are themselves still sealed.
//!
//! ## Message Flow
//!
//! ```text
//! Device A                        Device B
//!   |                               |
//!   |--- Ping {timestamp} --------->|
//!   |<-- Pong {timestamp} ----------|   (liveness + RTT)
//!   |                               |
//!   |--- SyncRequest {since} ------>|
//!   |<-- SyncResponse {records} ----|
//!   |                               |
//!   |--- History {records} -------->|   (push on local change)
//!   |--- Device {device} ---------->|
//! ```

use serde::{Deserialize, Serialize};

use crate::crypto::{RecordCrypto, NONCE_SIZE};
use crate::error::{SyncError, SyncResult};
use crate::types::{now_millis, DeviceRecord, EncryptedHistoryRecord};

/// The six peer message kinds.
///
/// This is a closed set: every inbound message is one of these, matched
/// exhaustively by the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerMessage {
    /// Liveness probe carrying the sender's clock
    Ping {
        /// Sender's send time (epoch millis), echoed back in `Pong`
        timestamp: i64,
    },
    /// Liveness reply echoing the probe's timestamp
    Pong {
        /// The `Ping` timestamp being answered
        timestamp: i64,
    },
    /// Push of sealed history records
    History {
        /// Records, still record-level encrypted
        records: Vec<EncryptedHistoryRecord>,
    },
    /// Push of device info
    Device {
        /// The sender's device record
        device: DeviceRecord,
    },
    /// Request for records modified since a watermark
    SyncRequest {
        /// Only records with `last_modified >= since`; `None` means all
        since: Option<i64>,
    },
    /// Answer to a `SyncRequest`
    SyncResponse {
        /// Matching records, still record-level encrypted
        records: Vec<EncryptedHistoryRecord>,
    },
}

impl PeerMessage {
    /// Short kind name, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Ping { .. } => "ping",
            PeerMessage::Pong { .. } => "pong",
            PeerMessage::History { .. } => "history",
            PeerMessage::Device { .. } => "device",
            PeerMessage::SyncRequest { .. } => "sync-request",
            PeerMessage::SyncResponse { .. } => "sync-response",
        }
    }
}

/// One peer message plus sender attribution, the unit of encryption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEnvelope {
    /// Sending client's id
    pub sender: String,
    /// Send time (epoch millis)
    pub sent_at: i64,
    /// The message itself
    pub message: PeerMessage,
}

impl PeerEnvelope {
    /// Wrap a message for sending now.
    pub fn new(sender: impl Into<String>, message: PeerMessage) -> Self {
        Self {
            sender: sender.into(),
            sent_at: now_millis(),
            message,
        }
    }
}

/// An encrypted frame as it travels the data channel.
///
/// The nonce rides in the header; the ciphertext is the postcard-encoded
/// [`PeerEnvelope`] plus the AEAD tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelFrame {
    /// Nonce used for this frame
    pub iv: [u8; NONCE_SIZE],
    /// Encrypted envelope + auth tag
    pub ciphertext: Vec<u8>,
}

impl ChannelFrame {
    /// Encrypt an envelope into a frame with a fresh nonce.
    pub fn seal(envelope: &PeerEnvelope, crypto: &RecordCrypto) -> SyncResult<Self> {
        let plaintext = postcard::to_allocvec(envelope)
            .map_err(|e| SyncError::Serialization(format!("Failed to encode envelope: {}", e)))?;
        let iv = RecordCrypto::generate_nonce();
        let ciphertext = crypto.encrypt_with_nonce(&plaintext, &iv)?;
        Ok(Self { iv, ciphertext })
    }

    /// Decrypt a frame back into its envelope.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Authentication` on tampering or a wrong key,
    /// `SyncError::Serialization` if the decrypted bytes are malformed.
    pub fn open(&self, crypto: &RecordCrypto) -> SyncResult<PeerEnvelope> {
        let plaintext = crypto.decrypt_with_nonce(&self.ciphertext, &self.iv)?;
        postcard::from_bytes(&plaintext)
            .map_err(|e| SyncError::Serialization(format!("Failed to decode envelope: {}", e)))
    }

    /// Encode the frame for the wire.
    pub fn to_bytes(&self) -> SyncResult<Vec<u8>> {
        postcard::to_allocvec(self)
            .map_err(|e| SyncError::Serialization(format!("Failed to encode frame: {}", e)))
    }

    /// Decode a frame from wire bytes.
    pub fn from_bytes(bytes: &[u8]) -> SyncResult<Self> {
        postcard::from_bytes(bytes)
            .map_err(|e| SyncError::Serialization(format!("Failed to decode frame: {}", e)))
    }
}

/// Derive the symmetric key for one peer connection.
///
/// The context folds in both client ids in sorted order, so either end
/// derives the same key while connections between different device pairs
/// use different keys. Only devices holding the shared secret can derive
/// any of them.
pub fn channel_crypto(secret: &str, local_id: &str, peer_id: &str) -> SyncResult<RecordCrypto> {
    let (lo, hi) = if local_id <= peer_id {
        (local_id, peer_id)
    } else {
        (peer_id, local_id)
    };
    RecordCrypto::derive(secret, &format!("peer-channel:{}:{}", lo, hi))
}
