//! In-memory peer transport
//!
//! [`MockPeerFactory`] hands out transports that return canned descriptions
//! and log every call as `"<peer>:<call>"`. A factory built with
//! [`MockPeerFactory::failing_on`] makes one named call fail.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use bytes::Bytes;
use fedlink_core::identity::PeerId;
use fedlink_core::{Error, Result};
use fedlink_net::signaling::{IceCandidate, SessionDescription};
use tokio::sync::mpsc;

use super::connection::{ConnectionId, PeerEvent, PeerTransport, PeerTransportFactory};

type CallLog = Arc<StdMutex<Vec<String>>>;
type EventTable = HashMap<PeerId, (ConnectionId, mpsc::UnboundedSender<PeerEvent>)>;

/// Factory for [`MockPeerTransport`]s sharing one call log
#[derive(Debug, Clone, Default)]
pub struct MockPeerFactory {
    log: CallLog,
    events: Arc<StdMutex<EventTable>>,
    failing: Option<&'static str>,
}

impl MockPeerFactory {
    /// Create an empty factory
    pub fn new() -> Self {
        Self::default()
    }

    /// Transports fail `call` (for example `"create_offer"`) after logging it
    pub fn failing_on(mut self, call: &'static str) -> Self {
        self.failing = Some(call);
        self
    }

    /// Id of the transport most recently created for `peer`
    pub fn connection(&self, peer: &PeerId) -> Option<ConnectionId> {
        self.events.lock().ok()?.get(peer).map(|(id, _)| *id)
    }

    /// Calls made so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    /// Calls made so far for one peer, without the peer prefix
    pub fn calls_for(&self, peer: &str) -> Vec<String> {
        let prefix = format!("{peer}:");
        self.calls()
            .into_iter()
            .filter_map(|call| call.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    /// Raise `event` as if `peer`'s transport produced it
    pub fn emit(&self, peer: &PeerId, event: PeerEvent) -> Result<()> {
        let events = self
            .events
            .lock()
            .map_err(|_| Error::Peer("mock event table poisoned".into()))?;
        let (_, tx) = events.get(peer).ok_or_else(|| Error::UnknownPeer(peer.to_string()))?;
        tx.send(event).map_err(|_| Error::Peer("engine stopped".into()))
    }
}

#[async_trait]
impl PeerTransportFactory for MockPeerFactory {
    async fn create(
        &self,
        peer: &PeerId,
        connection: ConnectionId,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn PeerTransport>> {
        if let Ok(mut table) = self.events.lock() {
            table.insert(peer.clone(), (connection, events));
        }
        let transport = MockPeerTransport {
            peer: peer.clone(),
            connection,
            log: self.log.clone(),
            failing: self.failing,
        };
        transport.record("create")?;
        Ok(Box::new(transport))
    }
}

/// Transport that only records what it is asked to do
#[derive(Debug)]
pub struct MockPeerTransport {
    peer: PeerId,
    connection: ConnectionId,
    log: CallLog,
    failing: Option<&'static str>,
}

impl MockPeerTransport {
    fn record(&self, call: impl core::fmt::Display) -> Result<()> {
        let call = call.to_string();
        if let Ok(mut log) = self.log.lock() {
            log.push(format!("{}:{call}", self.peer));
        }
        match self.failing {
            Some(failing) if call.starts_with(failing) => {
                Err(Error::Peer(format!("mock {call} failed for {}", self.peer)))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl PeerTransport for MockPeerTransport {
    async fn create_data_channel(&self, label: &str) -> Result<()> {
        self.record(format!("data_channel({label})"))
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.record("create_offer")?;
        Ok(SessionDescription::offer(format!("offer-for-{}", self.peer)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.record("create_answer")?;
        Ok(SessionDescription::answer(format!("answer-for-{}", self.peer)))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.record(format!("set_remote({})", description.sdp))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.record(format!("add_candidate({})", candidate.candidate))
    }

    async fn send(&self, payload: Bytes) -> Result<()> {
        self.record(format!("send({} bytes)", payload.len()))
    }

    async fn close(&self) -> Result<()> {
        self.record("close")
    }
}
