//! Peer negotiation engine
//!
//! The engine owns the peer table. Inbound signaling and transport events are
//! applied one at a time, either by calling [`PeerNegotiationEngine::handle_signal`]
//! and [`PeerNegotiationEngine::handle_event`] directly or by spawning the
//! engine as a task with [`PeerNegotiationEngine::spawn`], which then becomes
//! the table's only writer.
//!
//! | inbound                 | action                                              |
//! |-------------------------|-----------------------------------------------------|
//! | `join-room(X)`          | new initiator, open channel, send offer to X        |
//! | `internal(offer)` from Y| new receiver, apply offer, send answer to Y         |
//! | `internal(answer)` from X | apply answer to the existing connection           |
//! | `internal(candidate)`   | record, apply once the remote description is set    |
//! | `peer-left(X)`          | close and forget X                                  |
//!
//! Every transport is created with a fresh [`ConnectionId`]. Transport events
//! whose id is not the one in the table come from a replaced or discarded
//! transport and are dropped.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use fedlink_core::identity::{PeerId, ScopeId};
use fedlink_core::{Error, Result};
use fedlink_net::signaling::{InternalMessage, PeerPayload, RoomMembership, SignalingMessage};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use super::connection::{ConnectionId, PeerConnection, PeerEvent, PeerRole, PeerState, PeerTransportFactory};

const DATA_CAPACITY: usize = 256;

/// Payload received from a peer's data channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerData {
    /// Sender
    pub peer: PeerId,
    /// Raw payload
    pub payload: Bytes,
}

/// Drives offer/answer/ICE negotiation with every peer in one scope
pub struct PeerNegotiationEngine {
    local_id: PeerId,
    scope_id: ScopeId,
    factory: Arc<dyn PeerTransportFactory>,
    peers: HashMap<PeerId, PeerConnection>,
    next_connection: u64,
    outbound: mpsc::UnboundedSender<SignalingMessage>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    events: Option<mpsc::UnboundedReceiver<PeerEvent>>,
    data: broadcast::Sender<PeerData>,
}

impl core::fmt::Debug for PeerNegotiationEngine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PeerNegotiationEngine")
            .field("local_id", &self.local_id)
            .field("scope_id", &self.scope_id)
            .field("peers", &self.peers)
            .finish_non_exhaustive()
    }
}

impl PeerNegotiationEngine {
    /// Create an engine for `local_id` in `scope_id`; signaling it produces
    /// is queued on `outbound`
    pub fn new(
        local_id: PeerId,
        scope_id: ScopeId,
        factory: Arc<dyn PeerTransportFactory>,
        outbound: mpsc::UnboundedSender<SignalingMessage>,
    ) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (data, _) = broadcast::channel(DATA_CAPACITY);
        Self {
            local_id,
            scope_id,
            factory,
            peers: HashMap::new(),
            next_connection: 0,
            outbound,
            events_tx,
            events: Some(events),
            data,
        }
    }

    /// Our peer id
    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Connection record for `peer`
    pub fn peer(&self, peer: &PeerId) -> Option<&PeerConnection> {
        self.peers.get(peer)
    }

    /// Number of tracked peers
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Receive payloads from every peer's data channel
    pub fn subscribe_data(&self) -> broadcast::Receiver<PeerData> {
        self.data.subscribe()
    }

    /// Wait for the next transport event
    pub async fn next_event(&mut self) -> Option<PeerEvent> {
        self.events.as_mut()?.recv().await
    }

    /// Apply one inbound signaling message
    pub async fn handle_signal(&mut self, message: SignalingMessage) -> Result<()> {
        match message {
            SignalingMessage::JoinRoom(membership) => self.on_join(membership).await,
            SignalingMessage::PeerLeft(membership) => {
                self.on_leave(membership).await;
                Ok(())
            }
            SignalingMessage::Internal(message) => self.on_internal(message).await,
            other => {
                tracing::trace!(kind = other.message_type(), "not a peer message");
                Ok(())
            }
        }
    }

    /// Apply one transport event
    pub async fn handle_event(&mut self, event: PeerEvent) -> Result<()> {
        let current = self.peers.get(event.peer()).map(PeerConnection::id);
        if current != Some(event.connection()) {
            tracing::debug!(
                peer = %event.peer(),
                connection = %event.connection(),
                "event from a replaced transport dropped"
            );
            return Ok(());
        }
        match event {
            PeerEvent::LocalCandidate { peer, candidate, .. } => {
                self.emit(peer, PeerPayload::Candidate(candidate))
            }
            PeerEvent::ChannelOpen { peer, .. } => {
                if let Some(connection) = self.peers.get_mut(&peer) {
                    connection.mark_connected();
                    tracing::info!(peer = %peer, "data channel open");
                }
                Ok(())
            }
            PeerEvent::Data { peer, payload, .. } => {
                // No subscribers is fine.
                let _ = self.data.send(PeerData { peer, payload });
                Ok(())
            }
            PeerEvent::Closed { peer, connection } => {
                self.peers.remove(&peer);
                tracing::info!(peer = %peer, %connection, "peer connection closed");
                Ok(())
            }
        }
    }

    /// Send a payload on `peer`'s data channel
    pub async fn send_to(&self, peer: &PeerId, payload: Bytes) -> Result<()> {
        let connection = self
            .peers
            .get(peer)
            .ok_or_else(|| Error::UnknownPeer(peer.to_string()))?;
        connection.send(payload).await
    }

    /// Close and forget every connection
    pub async fn close_all(&mut self) {
        for (_, connection) in self.peers.drain() {
            discard(connection).await;
        }
    }

    async fn on_join(&mut self, membership: RoomMembership) -> Result<()> {
        let peer = membership.worker_id;
        if peer == self.local_id || membership.scope_id != self.scope_id {
            return Ok(());
        }
        if self.peers.contains_key(&peer) {
            tracing::debug!(peer = %peer, "join-room for a known peer ignored");
            return Ok(());
        }

        let mut connection = self.connect(&peer, PeerRole::Initiator).await?;
        let offer = match connection.open_as_initiator().await {
            Ok(offer) => offer,
            Err(e) => {
                discard(connection).await;
                return Err(e);
            }
        };
        self.peers.insert(peer.clone(), connection);
        tracing::info!(peer = %peer, "offer sent");
        self.emit(peer, PeerPayload::Offer(offer))
    }

    async fn on_leave(&mut self, membership: RoomMembership) {
        let Some(connection) = self.peers.remove(&membership.worker_id) else {
            return;
        };
        tracing::info!(peer = %membership.worker_id, scope = %membership.scope_id, "peer left");
        discard(connection).await;
    }

    async fn on_internal(&mut self, message: InternalMessage) -> Result<()> {
        if message.to != self.local_id {
            tracing::trace!(to = %message.to, "internal message for another worker");
            return Ok(());
        }
        let peer = message.worker_id;
        match message.payload {
            PeerPayload::Offer(offer) => {
                if let Some(stale) = self.peers.remove(&peer) {
                    tracing::debug!(peer = %peer, connection = %stale.id(), "replacing connection on new offer");
                    discard(stale).await;
                }
                let mut connection = self.connect(&peer, PeerRole::Receiver).await?;
                let answer = match connection.accept_offer(offer).await {
                    Ok(answer) => answer,
                    Err(e) => {
                        discard(connection).await;
                        return Err(e);
                    }
                };
                self.peers.insert(peer.clone(), connection);
                tracing::info!(peer = %peer, "answer sent");
                self.emit(peer, PeerPayload::Answer(answer))
            }
            PeerPayload::Answer(answer) => {
                let connection = self
                    .peers
                    .get_mut(&peer)
                    .ok_or_else(|| Error::UnknownPeer(peer.to_string()))?;
                connection.apply_answer(answer).await?;
                tracing::info!(peer = %peer, "answer applied");
                Ok(())
            }
            PeerPayload::Candidate(candidate) => match self.peers.get_mut(&peer) {
                Some(connection) => connection.add_candidate(candidate).await,
                None => {
                    tracing::debug!(peer = %peer, "candidate for unknown peer dropped");
                    Ok(())
                }
            },
        }
    }

    async fn connect(&mut self, peer: &PeerId, role: PeerRole) -> Result<PeerConnection> {
        self.next_connection += 1;
        let id = ConnectionId(self.next_connection);
        let transport = self.factory.create(peer, id, self.events_tx.clone()).await?;
        Ok(PeerConnection::new(peer.clone(), id, role, transport))
    }

    fn emit(&self, to: PeerId, payload: PeerPayload) -> Result<()> {
        let message = SignalingMessage::Internal(InternalMessage {
            worker_id: self.local_id.clone(),
            scope_id: self.scope_id.clone(),
            to,
            payload,
        });
        self.outbound
            .send(message)
            .map_err(|_| Error::Peer("signaling outbound queue closed".into()))
    }

    /// Run the engine on its own task, fed by `signals`
    pub fn spawn(self, signals: broadcast::Receiver<SignalingMessage>) -> PeerEngineHandle {
        let (commands, queue) = mpsc::unbounded_channel();
        let data = self.data.clone();
        let task = tokio::spawn(self.run(signals, queue));
        PeerEngineHandle { commands, data, task }
    }

    async fn run(
        mut self,
        mut signals: broadcast::Receiver<SignalingMessage>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let Some(mut events) = self.events.take() else {
            return;
        };
        loop {
            tokio::select! {
                signal = signals.recv() => match signal {
                    Ok(message) => {
                        if let Err(e) = self.handle_signal(message).await {
                            tracing::warn!(error = %e, "peer signaling message dropped");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "peer engine lagged behind signaling");
                    }
                    Err(RecvError::Closed) => break,
                },
                Some(event) = events.recv() => {
                    if let Err(e) = self.handle_event(event).await {
                        tracing::warn!(error = %e, "peer event dropped");
                    }
                }
                command = commands.recv() => match command {
                    Some(Command::Send { peer, payload, reply }) => {
                        let _ = reply.send(self.send_to(&peer, payload).await);
                    }
                    Some(Command::Peers { reply }) => {
                        let _ = reply.send(
                            self.peers.iter().map(|(id, c)| (id.clone(), c.state())).collect(),
                        );
                    }
                    Some(Command::Shutdown) | None => break,
                },
            }
        }
        self.close_all().await;
        tracing::debug!(local = %self.local_id, "peer engine stopped");
    }
}

async fn discard(connection: PeerConnection) {
    if let Err(e) = connection.close().await {
        tracing::warn!(peer = %connection.peer_id(), connection = %connection.id(), error = %e, "peer close failed");
    }
}

enum Command {
    Send {
        peer: PeerId,
        payload: Bytes,
        reply: oneshot::Sender<Result<()>>,
    },
    Peers {
        reply: oneshot::Sender<Vec<(PeerId, PeerState)>>,
    },
    Shutdown,
}

/// Handle to a spawned [`PeerNegotiationEngine`]
#[derive(Debug)]
pub struct PeerEngineHandle {
    commands: mpsc::UnboundedSender<Command>,
    data: broadcast::Sender<PeerData>,
    task: JoinHandle<()>,
}

impl PeerEngineHandle {
    /// Send a payload to `peer`
    pub async fn send_to(&self, peer: &PeerId, payload: Bytes) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Send {
                peer: peer.clone(),
                payload,
                reply,
            })
            .map_err(|_| Error::Peer("peer engine stopped".into()))?;
        response
            .await
            .map_err(|_| Error::Peer("peer engine stopped".into()))?
    }

    /// Snapshot of every tracked peer and its state
    pub async fn peers(&self) -> Result<Vec<(PeerId, PeerState)>> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Peers { reply })
            .map_err(|_| Error::Peer("peer engine stopped".into()))?;
        response.await.map_err(|_| Error::Peer("peer engine stopped".into()))
    }

    /// Receive payloads from every peer's data channel
    pub fn subscribe_data(&self) -> broadcast::Receiver<PeerData> {
        self.data.subscribe()
    }

    /// Close every connection and wait for the engine task to end
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "peer engine task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::mock::MockPeerFactory;
    use fedlink_net::signaling::{IceCandidate, SessionDescription};

    fn engine(local: &str) -> (PeerNegotiationEngine, MockPeerFactory, mpsc::UnboundedReceiver<SignalingMessage>) {
        let factory = MockPeerFactory::new();
        let (outbound, sent) = mpsc::unbounded_channel();
        let engine = PeerNegotiationEngine::new(
            PeerId::new(local),
            ScopeId::new("scope"),
            Arc::new(factory.clone()),
            outbound,
        );
        (engine, factory, sent)
    }

    fn internal(from: &str, to: &str, payload: PeerPayload) -> SignalingMessage {
        SignalingMessage::Internal(InternalMessage {
            worker_id: PeerId::new(from),
            scope_id: ScopeId::new("scope"),
            to: PeerId::new(to),
            payload,
        })
    }

    #[tokio::test]
    async fn own_join_and_foreign_scope_are_ignored() {
        let (mut engine, factory, _sent) = engine("a");
        engine
            .handle_signal(SignalingMessage::JoinRoom(RoomMembership {
                worker_id: PeerId::new("A"),
                scope_id: ScopeId::new("scope"),
            }))
            .await
            .unwrap();
        engine
            .handle_signal(SignalingMessage::JoinRoom(RoomMembership {
                worker_id: PeerId::new("b"),
                scope_id: ScopeId::new("elsewhere"),
            }))
            .await
            .unwrap();
        assert_eq!(engine.peer_count(), 0);
        assert!(factory.calls().is_empty());
    }

    #[tokio::test]
    async fn messages_for_other_workers_are_ignored() {
        let (mut engine, factory, mut sent) = engine("a");
        engine
            .handle_signal(internal("b", "c", PeerPayload::Offer(SessionDescription::offer("x"))))
            .await
            .unwrap();
        assert_eq!(engine.peer_count(), 0);
        assert!(factory.calls().is_empty());
        assert!(sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn second_answer_is_rejected() {
        let (mut engine, _factory, _sent) = engine("a");
        engine
            .handle_signal(SignalingMessage::JoinRoom(RoomMembership {
                worker_id: PeerId::new("b"),
                scope_id: ScopeId::new("scope"),
            }))
            .await
            .unwrap();
        let answer = || internal("b", "a", PeerPayload::Answer(SessionDescription::answer("y")));
        engine.handle_signal(answer()).await.unwrap();
        let err = engine.handle_signal(answer()).await.unwrap_err();
        assert!(matches!(err, Error::Peer(_)));
    }

    #[tokio::test]
    async fn local_candidates_are_forwarded_to_the_peer() {
        let (mut engine, factory, mut sent) = engine("a");
        engine
            .handle_signal(internal("b", "a", PeerPayload::Offer(SessionDescription::offer("o"))))
            .await
            .unwrap();
        let _answer = sent.recv().await.unwrap();

        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
            sdp_mline_index: 0,
            sdp_mid: Some("0".into()),
        };
        let b = PeerId::new("b");
        factory
            .emit(
                &b,
                PeerEvent::LocalCandidate {
                    peer: b.clone(),
                    connection: engine.peer(&b).unwrap().id(),
                    candidate: candidate.clone(),
                },
            )
            .unwrap();
        let event = engine.next_event().await.unwrap();
        engine.handle_event(event).await.unwrap();

        assert_eq!(
            sent.recv().await.unwrap(),
            internal("a", "b", PeerPayload::Candidate(candidate))
        );
    }

    #[tokio::test]
    async fn data_events_reach_subscribers() {
        let (mut engine, _factory, _sent) = engine("a");
        engine
            .handle_signal(internal("b", "a", PeerPayload::Offer(SessionDescription::offer("o"))))
            .await
            .unwrap();
        let b = PeerId::new("b");
        let connection = engine.peer(&b).unwrap().id();
        let mut data = engine.subscribe_data();
        engine
            .handle_event(PeerEvent::Data {
                peer: b.clone(),
                connection,
                payload: Bytes::from_static(b"hello"),
            })
            .await
            .unwrap();
        let received = data.recv().await.unwrap();
        assert_eq!(received.peer, b);
        assert_eq!(received.payload, Bytes::from_static(b"hello"));

        // Nothing is tracked for "c", so its events go nowhere.
        engine
            .handle_event(PeerEvent::Data {
                peer: PeerId::new("c"),
                connection,
                payload: Bytes::from_static(b"stray"),
            })
            .await
            .unwrap();
        assert!(data.try_recv().is_err());
    }

    #[tokio::test]
    async fn each_transport_gets_a_fresh_connection_id() {
        let (mut engine, factory, _sent) = engine("a");
        for peer in ["b", "c"] {
            engine
                .handle_signal(SignalingMessage::JoinRoom(RoomMembership {
                    worker_id: PeerId::new(peer),
                    scope_id: ScopeId::new("scope"),
                }))
                .await
                .unwrap();
        }
        let b = engine.peer(&PeerId::new("b")).unwrap().id();
        let c = engine.peer(&PeerId::new("c")).unwrap().id();
        assert_ne!(b, c);
        assert_eq!(factory.connection(&PeerId::new("c")), Some(c));
    }

    #[tokio::test]
    async fn spawned_engine_answers_and_shuts_down() {
        let (engine, factory, mut sent) = engine("a");
        let (signals, inbound) = broadcast::channel(16);
        let handle = engine.spawn(inbound);

        signals
            .send(internal("b", "a", PeerPayload::Offer(SessionDescription::offer("o"))))
            .unwrap();
        let answer = sent.recv().await.unwrap();
        assert_eq!(
            answer,
            internal("a", "b", PeerPayload::Answer(SessionDescription::answer("answer-for-b")))
        );
        assert_eq!(
            handle.peers().await.unwrap(),
            vec![(PeerId::new("b"), PeerState::Answered)]
        );

        handle.send_to(&PeerId::new("b"), Bytes::from_static(b"hi")).await.unwrap();
        assert!(matches!(
            handle.send_to(&PeerId::new("z"), Bytes::new()).await,
            Err(Error::UnknownPeer(_))
        ));

        handle.shutdown().await;
        assert_eq!(factory.calls_for("b").last().map(String::as_str), Some("close"));
    }
}
