//! Peer-to-peer negotiation over the signaling channel
//!
//! - [`connection`]: per-peer state and the transport seam
//! - [`engine`]: the offer/answer/ICE state machine over all peers
//! - [`mock`]: in-memory transports for tests
//! - `webrtc` (feature `webrtc`): the `webrtc`-crate backend

pub mod connection;
pub mod engine;
pub mod mock;

#[cfg(feature = "webrtc")]
pub mod webrtc;

pub use connection::{
    ConnectionId, PeerConnection, PeerEvent, PeerRole, PeerState, PeerTransport, PeerTransportFactory, DATA_CHANNEL_LABEL,
};
pub use engine::{PeerData, PeerEngineHandle, PeerNegotiationEngine};
pub use mock::MockPeerFactory;

/// Public STUN servers used when none are configured
pub const DEFAULT_ICE_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
];
