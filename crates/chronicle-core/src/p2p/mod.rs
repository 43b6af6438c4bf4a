//! Direct encrypted peer-to-peer transport
//!
//! Establishes encrypted channels between two devices over a
//! caller-supplied signaling path, exchanges typed messages, and feeds
//! inbound records into an attached store. Channel-level encryption is
//! independent of record-level encryption: frames wrap messages whose
//! record payloads are themselves still sealed.

mod connection;
mod protocol;
mod transport;

pub use connection::{
    ConnectionState, IceCandidate, MemorySignaling, PeerChannel, SdpKind, SessionDescription,
    Signaling,
};
pub use protocol::{channel_crypto, ChannelFrame, PeerEnvelope, PeerMessage};
pub use transport::{
    PeerEvent, PeerStatus, PeerSyncResponse, PeerSyncTransport, PeerTransport,
    DEFAULT_RESPONSE_WINDOW,
};
