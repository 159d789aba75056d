//! Per-peer connection state
//!
//! [`PeerConnection`] tracks one remote worker's offer/answer progress and
//! ICE candidates. The actual connection sits behind [`PeerTransport`] so the
//! negotiation logic can run against a WebRTC stack or a test double.

use async_trait::async_trait;
use bytes::Bytes;
use fedlink_core::identity::PeerId;
use fedlink_core::{Error, Result};
use fedlink_net::signaling::{IceCandidate, SessionDescription};
use tokio::sync::mpsc;

/// Label of the data channel opened by the initiator
pub const DATA_CHANNEL_LABEL: &str = "dataChannel";

/// Which side created the offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// We sent the offer
    Initiator,
    /// We answered an offer
    Receiver,
}

/// Negotiation progress of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Created, nothing exchanged
    New,
    /// Offer sent, waiting for the answer
    OfferSent,
    /// Remote offer applied
    OfferReceived,
    /// Answer sent, waiting for the channel to open
    Answered,
    /// Both descriptions applied, or the data channel opened
    Connected,
}

/// Identity of one transport instance.
///
/// A peer that reconnects gets a new transport with a new id, so events still
/// in flight from the old one can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl core::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Asynchronous event raised by a [`PeerTransport`]
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// Local ICE candidate to forward to the peer
    LocalCandidate {
        /// Remote peer
        peer: PeerId,
        /// Transport that raised the event
        connection: ConnectionId,
        /// Candidate
        candidate: IceCandidate,
    },
    /// Data channel is open
    ChannelOpen {
        /// Remote peer
        peer: PeerId,
        /// Transport that raised the event
        connection: ConnectionId,
    },
    /// Payload received on the data channel
    Data {
        /// Remote peer
        peer: PeerId,
        /// Transport that raised the event
        connection: ConnectionId,
        /// Raw payload
        payload: Bytes,
    },
    /// Connection failed or was closed
    Closed {
        /// Remote peer
        peer: PeerId,
        /// Transport that raised the event
        connection: ConnectionId,
    },
}

impl PeerEvent {
    /// Remote peer the event concerns
    pub fn peer(&self) -> &PeerId {
        match self {
            PeerEvent::LocalCandidate { peer, .. }
            | PeerEvent::ChannelOpen { peer, .. }
            | PeerEvent::Data { peer, .. }
            | PeerEvent::Closed { peer, .. } => peer,
        }
    }

    /// Transport that raised the event
    pub fn connection(&self) -> ConnectionId {
        match self {
            PeerEvent::LocalCandidate { connection, .. }
            | PeerEvent::ChannelOpen { connection, .. }
            | PeerEvent::Data { connection, .. }
            | PeerEvent::Closed { connection, .. } => *connection,
        }
    }
}

/// One peer-to-peer connection
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Open the local data channel
    async fn create_data_channel(&self, label: &str) -> Result<()>;

    /// Create an offer and install it as the local description
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Create an answer and install it as the local description
    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Apply the remote offer or answer
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Apply a remote ICE candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Send a payload on the data channel
    async fn send(&self, payload: Bytes) -> Result<()>;

    /// Close the data channel and the connection
    async fn close(&self) -> Result<()>;
}

/// Creates [`PeerTransport`]s wired to the engine's event queue
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    /// Create a transport for `peer`, raising its events on `events` tagged
    /// with `connection`
    async fn create(
        &self,
        peer: &PeerId,
        connection: ConnectionId,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn PeerTransport>>;
}

/// Negotiation record for one remote peer
pub struct PeerConnection {
    peer_id: PeerId,
    id: ConnectionId,
    role: PeerRole,
    state: PeerState,
    transport: Box<dyn PeerTransport>,
    received_candidates: Vec<IceCandidate>,
    pending_candidates: Vec<IceCandidate>,
    remote_applied: bool,
}

impl core::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer_id", &self.peer_id)
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("received_candidates", &self.received_candidates.len())
            .field("pending_candidates", &self.pending_candidates.len())
            .finish()
    }
}

impl PeerConnection {
    /// Wrap a fresh transport
    pub fn new(peer_id: PeerId, id: ConnectionId, role: PeerRole, transport: Box<dyn PeerTransport>) -> Self {
        Self {
            peer_id,
            id,
            role,
            state: PeerState::New,
            transport,
            received_candidates: Vec::new(),
            pending_candidates: Vec::new(),
            remote_applied: false,
        }
    }

    /// Remote peer
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Transport instance backing this record
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Our side of the negotiation
    pub fn role(&self) -> PeerRole {
        self.role
    }

    /// Current progress
    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Every remote candidate received, in arrival order
    pub fn received_candidates(&self) -> &[IceCandidate] {
        &self.received_candidates
    }

    /// Candidates waiting for the remote description
    pub fn pending_candidates(&self) -> &[IceCandidate] {
        &self.pending_candidates
    }

    /// Open the data channel and produce the offer
    pub async fn open_as_initiator(&mut self) -> Result<SessionDescription> {
        self.expect_state(PeerState::New, "offer")?;
        self.transport.create_data_channel(DATA_CHANNEL_LABEL).await?;
        let offer = self.transport.create_offer().await?;
        self.state = PeerState::OfferSent;
        Ok(offer)
    }

    /// Apply a remote offer and produce the answer
    pub async fn accept_offer(&mut self, offer: SessionDescription) -> Result<SessionDescription> {
        self.expect_state(PeerState::New, "offer")?;
        self.apply_remote(offer).await?;
        self.state = PeerState::OfferReceived;
        let answer = self.transport.create_answer().await?;
        self.state = PeerState::Answered;
        Ok(answer)
    }

    /// Apply the remote answer to our offer
    pub async fn apply_answer(&mut self, answer: SessionDescription) -> Result<()> {
        self.expect_state(PeerState::OfferSent, "answer")?;
        self.apply_remote(answer).await?;
        self.state = PeerState::Connected;
        Ok(())
    }

    /// Record a remote candidate, applying it once a remote description is set
    pub async fn add_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        self.received_candidates.push(candidate.clone());
        if self.remote_applied {
            self.transport.add_ice_candidate(candidate).await
        } else {
            tracing::trace!(peer = %self.peer_id, "candidate buffered until remote description");
            self.pending_candidates.push(candidate);
            Ok(())
        }
    }

    /// Mark the data channel open
    pub fn mark_connected(&mut self) {
        self.state = PeerState::Connected;
    }

    /// Send on the data channel
    pub async fn send(&self, payload: Bytes) -> Result<()> {
        self.transport.send(payload).await
    }

    /// Close the connection
    pub async fn close(&self) -> Result<()> {
        self.transport.close().await
    }

    async fn apply_remote(&mut self, description: SessionDescription) -> Result<()> {
        self.transport.set_remote_description(description).await?;
        self.remote_applied = true;
        for candidate in std::mem::take(&mut self.pending_candidates) {
            self.transport.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    fn expect_state(&self, expected: PeerState, what: &str) -> Result<()> {
        if self.state != expected {
            return Err(Error::Peer(format!(
                "unexpected {what} from `{}` in state {:?}",
                self.peer_id, self.state
            )));
        }
        Ok(())
    }
}
