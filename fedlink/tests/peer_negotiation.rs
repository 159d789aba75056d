//! Offer/answer/ICE negotiation driven through signaling messages.

use std::sync::Arc;

use bytes::Bytes;
use fedlink::peer::{MockPeerFactory, PeerEvent, PeerNegotiationEngine, PeerRole, PeerState, DATA_CHANNEL_LABEL};
use fedlink::session::PeerSession;
use fedlink_core::identity::{PeerId, ProtocolId, ScopeId, WorkerId};
use fedlink_core::Error;
use fedlink_net::channel::SignalingChannel;
use fedlink_net::signaling::{
    IceCandidate, InternalMessage, PeerPayload, RoomMembership, SessionDescription, SignalingMessage,
};
use fedlink_net::MockConnector;
use serde_json::json;
use tokio::sync::mpsc;

fn engine(local: &str) -> (PeerNegotiationEngine, MockPeerFactory, mpsc::UnboundedReceiver<SignalingMessage>) {
    let factory = MockPeerFactory::new();
    let (outbound, sent) = mpsc::unbounded_channel();
    let engine = PeerNegotiationEngine::new(
        PeerId::new(local),
        ScopeId::new("scope-1"),
        Arc::new(factory.clone()),
        outbound,
    );
    (engine, factory, sent)
}

fn join(peer: &str) -> SignalingMessage {
    SignalingMessage::JoinRoom(RoomMembership {
        worker_id: PeerId::new(peer),
        scope_id: ScopeId::new("scope-1"),
    })
}

fn internal(from: &str, to: &str, payload: PeerPayload) -> SignalingMessage {
    SignalingMessage::Internal(InternalMessage {
        worker_id: PeerId::new(from),
        scope_id: ScopeId::new("scope-1"),
        to: PeerId::new(to),
        payload,
    })
}

fn candidate(port: u16) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:1 1 udp 2122260223 10.0.0.2 {port} typ host"),
        sdp_mline_index: 0,
        sdp_mid: Some("0".into()),
    }
}

#[tokio::test]
async fn every_newcomer_gets_an_offer() {
    let (mut engine, factory, mut sent) = engine("a");
    for peer in ["b", "c", "d"] {
        engine.handle_signal(join(peer)).await.unwrap();
        assert_eq!(
            sent.recv().await.unwrap(),
            internal("a", peer, PeerPayload::Offer(SessionDescription::offer(format!("offer-for-{peer}"))))
        );
        let connection = engine.peer(&PeerId::new(peer)).unwrap();
        assert_eq!(connection.role(), PeerRole::Initiator);
        assert_eq!(connection.state(), PeerState::OfferSent);
    }
    assert_eq!(engine.peer_count(), 3);
    assert_eq!(
        factory.calls_for("b"),
        vec![
            "create".to_string(),
            format!("data_channel({DATA_CHANNEL_LABEL})"),
            "create_offer".to_string(),
        ]
    );

    // A repeated announcement does not renegotiate.
    engine.handle_signal(join("b")).await.unwrap();
    assert!(sent.try_recv().is_err());
}

#[tokio::test]
async fn offer_is_answered_on_the_wire() {
    let (mut engine, factory, mut sent) = engine("a");
    engine
        .handle_signal(internal("b", "a", PeerPayload::Offer(SessionDescription::offer("v=0 b"))))
        .await
        .unwrap();

    let connection = engine.peer(&PeerId::new("b")).unwrap();
    assert_eq!(connection.role(), PeerRole::Receiver);
    assert_eq!(connection.state(), PeerState::Answered);
    assert_eq!(
        factory.calls_for("b"),
        vec!["create", "set_remote(v=0 b)", "create_answer"]
    );

    let frame = sent.recv().await.unwrap().encode().unwrap();
    let wire: serde_json::Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(
        wire,
        json!({
            "type": "webrtc: internal-message",
            "data": {
                "type": "answer",
                "workerId": "a",
                "scopeId": "scope-1",
                "to": "b",
                "data": {"type": "answer", "sdp": "answer-for-b"}
            }
        })
    );
}

#[tokio::test]
async fn answer_from_unknown_peer_is_an_error() {
    let (mut engine, factory, mut sent) = engine("a");
    let err = engine
        .handle_signal(internal("x", "a", PeerPayload::Answer(SessionDescription::answer("y"))))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownPeer(peer) if peer == "x"));
    assert_eq!(engine.peer_count(), 0);
    assert!(factory.calls().is_empty());
    assert!(sent.try_recv().is_err());
}

#[tokio::test]
async fn early_candidates_wait_for_the_answer() {
    let (mut engine, factory, mut sent) = engine("a");
    engine.handle_signal(join("b")).await.unwrap();
    let _offer = sent.recv().await.unwrap();

    engine
        .handle_signal(internal("b", "a", PeerPayload::Candidate(candidate(5000))))
        .await
        .unwrap();
    let connection = engine.peer(&PeerId::new("b")).unwrap();
    assert_eq!(connection.received_candidates(), &[candidate(5000)]);
    assert_eq!(connection.pending_candidates(), &[candidate(5000)]);
    assert!(!factory.calls_for("b").iter().any(|c| c.starts_with("add_candidate")));

    engine
        .handle_signal(internal("b", "a", PeerPayload::Answer(SessionDescription::answer("v=0 ans"))))
        .await
        .unwrap();
    let connection = engine.peer(&PeerId::new("b")).unwrap();
    assert_eq!(connection.state(), PeerState::Connected);
    assert!(connection.pending_candidates().is_empty());

    let calls = factory.calls_for("b");
    let tail = &calls[calls.len() - 2..];
    assert_eq!(tail[0], "set_remote(v=0 ans)");
    assert_eq!(tail[1], format!("add_candidate({})", candidate(5000).candidate));

    // Later candidates apply immediately.
    engine
        .handle_signal(internal("b", "a", PeerPayload::Candidate(candidate(5001))))
        .await
        .unwrap();
    assert_eq!(
        factory.calls_for("b").last().unwrap(),
        &format!("add_candidate({})", candidate(5001).candidate)
    );
    assert_eq!(engine.peer(&PeerId::new("b")).unwrap().received_candidates().len(), 2);
}

#[tokio::test]
async fn departed_peer_is_closed_and_forgotten() {
    let (mut engine, factory, mut sent) = engine("a");
    engine.handle_signal(join("b")).await.unwrap();
    engine.handle_signal(join("c")).await.unwrap();
    let _ = (sent.recv().await, sent.recv().await);

    let frame = r#"{"type":"webrtc: peer-left","data":{"workerId":"B","scopeId":"scope-1"}}"#;
    engine.handle_signal(SignalingMessage::decode(frame).unwrap()).await.unwrap();

    assert_eq!(engine.peer_count(), 1);
    assert!(engine.peer(&PeerId::new("b")).is_none());
    assert_eq!(factory.calls_for("b").last().map(String::as_str), Some("close"));
    assert!(!factory.calls_for("c").contains(&"close".to_string()));

    // Leaving twice is harmless.
    engine.handle_signal(SignalingMessage::decode(frame).unwrap()).await.unwrap();
    assert_eq!(engine.peer_count(), 1);
}

#[tokio::test]
async fn new_offer_replaces_an_existing_connection() {
    let (mut engine, factory, mut sent) = engine("a");
    engine.handle_signal(join("b")).await.unwrap();
    let _offer = sent.recv().await.unwrap();

    engine
        .handle_signal(internal("b", "a", PeerPayload::Offer(SessionDescription::offer("v=0 again"))))
        .await
        .unwrap();
    let connection = engine.peer(&PeerId::new("b")).unwrap();
    assert_eq!(connection.role(), PeerRole::Receiver);
    assert_eq!(connection.state(), PeerState::Answered);
    assert!(factory.calls_for("b").contains(&"close".to_string()));
}

#[tokio::test]
async fn events_from_a_replaced_transport_are_dropped() {
    let (mut engine, factory, mut sent) = engine("a");
    let b = PeerId::new("b");
    engine
        .handle_signal(internal("b", "a", PeerPayload::Offer(SessionDescription::offer("v=0 first"))))
        .await
        .unwrap();
    let first = engine.peer(&b).unwrap().id();
    engine
        .handle_signal(internal("b", "a", PeerPayload::Offer(SessionDescription::offer("v=0 second"))))
        .await
        .unwrap();
    let second = engine.peer(&b).unwrap().id();
    assert_ne!(first, second);
    let _ = (sent.recv().await, sent.recv().await);

    // The replaced transport keeps raising events for a while.
    let mut data = engine.subscribe_data();
    engine
        .handle_event(PeerEvent::Data {
            peer: b.clone(),
            connection: first,
            payload: Bytes::from_static(b"late"),
        })
        .await
        .unwrap();
    engine
        .handle_event(PeerEvent::Closed {
            peer: b.clone(),
            connection: first,
        })
        .await
        .unwrap();
    assert_eq!(engine.peer_count(), 1);
    assert_eq!(engine.peer(&b).unwrap().id(), second);
    assert_eq!(engine.peer(&b).unwrap().state(), PeerState::Answered);
    assert!(data.try_recv().is_err());

    // The live transport's events still apply.
    factory
        .emit(&b, PeerEvent::ChannelOpen { peer: b.clone(), connection: second })
        .unwrap();
    let event = engine.next_event().await.unwrap();
    engine.handle_event(event).await.unwrap();
    assert_eq!(engine.peer(&b).unwrap().state(), PeerState::Connected);

    engine
        .handle_event(PeerEvent::Closed {
            peer: b.clone(),
            connection: second,
        })
        .await
        .unwrap();
    assert_eq!(engine.peer_count(), 0);
}

#[tokio::test]
async fn failed_offer_closes_the_new_transport() {
    let factory = MockPeerFactory::new().failing_on("create_offer");
    let (outbound, mut sent) = mpsc::unbounded_channel();
    let mut engine = PeerNegotiationEngine::new(
        PeerId::new("a"),
        ScopeId::new("scope-1"),
        Arc::new(factory.clone()),
        outbound,
    );

    let err = engine.handle_signal(join("b")).await.unwrap_err();
    assert!(matches!(err, Error::Peer(_)));
    assert_eq!(engine.peer_count(), 0);
    assert!(sent.try_recv().is_err());
    assert_eq!(
        factory.calls_for("b"),
        vec![
            "create".to_string(),
            format!("data_channel({DATA_CHANNEL_LABEL})"),
            "create_offer".to_string(),
            "close".to_string(),
        ]
    );
}

#[tokio::test]
async fn failed_answer_closes_the_new_transport() {
    let factory = MockPeerFactory::new().failing_on("create_answer");
    let (outbound, mut sent) = mpsc::unbounded_channel();
    let mut engine = PeerNegotiationEngine::new(
        PeerId::new("a"),
        ScopeId::new("scope-1"),
        Arc::new(factory.clone()),
        outbound,
    );

    let err = engine
        .handle_signal(internal("b", "a", PeerPayload::Offer(SessionDescription::offer("v=0 b"))))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Peer(_)));
    assert_eq!(engine.peer_count(), 0);
    assert!(sent.try_recv().is_err());
    assert_eq!(factory.calls_for("b").last().map(String::as_str), Some("close"));
}

#[tokio::test]
async fn session_joins_the_scope_and_answers_peers() {
    let (connector, server) = MockConnector::new();
    let channel = SignalingChannel::new("ws://grid.example", Arc::new(connector));
    let factory = MockPeerFactory::new();

    let joining = tokio::spawn(PeerSession::join(
        channel.clone(),
        WorkerId::new("A"),
        ScopeId::new("scope-1"),
        ProtocolId::new("proto-7"),
        Arc::new(factory.clone()),
    ));

    let request = SignalingMessage::decode(&server.next_frame().await.unwrap()).unwrap();
    assert!(matches!(request, SignalingMessage::GetProtocolRequest(ref p) if p.protocol_id == ProtocolId::new("proto-7")));
    server.push(r#"{"type":"get-protocol","data":{"plans":{"1":"p"},"workers":2}}"#);

    let session = joining.await.unwrap().unwrap();
    assert_eq!(session.protocol()["workers"], 2);
    assert_eq!(
        SignalingMessage::decode(&server.next_frame().await.unwrap()).unwrap(),
        SignalingMessage::JoinRoom(RoomMembership {
            worker_id: PeerId::new("a"),
            scope_id: ScopeId::new("scope-1"),
        })
    );

    let offer = internal("b", "a", PeerPayload::Offer(SessionDescription::offer("v=0 b")));
    server.push(offer.encode().unwrap());
    assert_eq!(
        SignalingMessage::decode(&server.next_frame().await.unwrap()).unwrap(),
        internal("a", "b", PeerPayload::Answer(SessionDescription::answer("answer-for-b")))
    );
    assert_eq!(
        session.engine().peers().await.unwrap(),
        vec![(PeerId::new("b"), PeerState::Answered)]
    );

    session.stop().await;
    assert!(!channel.is_connected().await);
    assert_eq!(factory.calls_for("b").last().map(String::as_str), Some("close"));
}
