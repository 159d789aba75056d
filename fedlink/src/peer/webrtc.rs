//! WebRTC peer transport (`webrtc` feature)

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use fedlink_core::identity::PeerId;
use fedlink_core::{Error, Result};
use fedlink_net::signaling::{IceCandidate, SdpType, SessionDescription};
use tokio::sync::{mpsc, Mutex};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::connection::{ConnectionId, PeerEvent, PeerTransport, PeerTransportFactory};

type ChannelSlot = Arc<Mutex<Option<Arc<RTCDataChannel>>>>;

fn peer_error(err: webrtc::Error) -> Error {
    Error::Peer(err.to_string())
}

/// Creates `webrtc`-crate peer connections
#[derive(Debug, Clone)]
pub struct WebRtcFactory {
    ice_servers: Vec<String>,
}

impl WebRtcFactory {
    /// Use `ice_servers` (STUN/TURN URLs) for every connection
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl PeerTransportFactory for WebRtcFactory {
    async fn create(
        &self,
        peer: &PeerId,
        connection: ConnectionId,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn PeerTransport>> {
        let mut media = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media).map_err(peer_error)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers: vec![RTCIceServer {
                    urls: self.ice_servers.clone(),
                    ..Default::default()
                }],
                ..Default::default()
            })
            .await
            .map_err(peer_error)?,
        );

        let channel: ChannelSlot = Arc::new(Mutex::new(None));
        forward_candidates(&pc, peer.clone(), connection, events.clone());
        watch_connection_state(&pc, peer.clone(), connection, events.clone());
        {
            let channel = channel.clone();
            let peer = peer.clone();
            let events = events.clone();
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let channel = channel.clone();
                let peer = peer.clone();
                let events = events.clone();
                Box::pin(async move {
                    tracing::debug!(peer = %peer, label = dc.label(), "remote data channel");
                    attach_channel(&dc, peer, connection, events);
                    *channel.lock().await = Some(dc);
                })
            }));
        }

        Ok(Box::new(WebRtcPeer {
            peer: peer.clone(),
            connection,
            pc,
            channel,
            events,
        }))
    }
}

fn forward_candidates(
    pc: &RTCPeerConnection,
    peer: PeerId,
    connection: ConnectionId,
    events: mpsc::UnboundedSender<PeerEvent>,
) {
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let peer = peer.clone();
        let events = events.clone();
        Box::pin(async move {
            // `None` marks the end of gathering.
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = events.send(PeerEvent::LocalCandidate {
                        peer,
                        connection,
                        candidate: IceCandidate {
                            candidate: init.candidate,
                            sdp_mline_index: init.sdp_mline_index.unwrap_or(0),
                            sdp_mid: init.sdp_mid,
                        },
                    });
                }
                Err(e) => tracing::warn!(peer = %peer, error = %e, "local candidate not serializable"),
            }
        })
    }));
}

fn watch_connection_state(
    pc: &RTCPeerConnection,
    peer: PeerId,
    connection: ConnectionId,
    events: mpsc::UnboundedSender<PeerEvent>,
) {
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let peer = peer.clone();
        let events = events.clone();
        Box::pin(async move {
            tracing::debug!(peer = %peer, %connection, ?state, "peer connection state");
            if matches!(state, RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed) {
                let _ = events.send(PeerEvent::Closed { peer, connection });
            }
        })
    }));
}

fn attach_channel(
    dc: &Arc<RTCDataChannel>,
    peer: PeerId,
    connection: ConnectionId,
    events: mpsc::UnboundedSender<PeerEvent>,
) {
    {
        let peer = peer.clone();
        let events = events.clone();
        dc.on_open(Box::new(move || {
            let peer = peer.clone();
            let events = events.clone();
            Box::pin(async move {
                let _ = events.send(PeerEvent::ChannelOpen { peer, connection });
            })
        }));
    }
    dc.on_message(Box::new(move |message: DataChannelMessage| {
        let peer = peer.clone();
        let events = events.clone();
        Box::pin(async move {
            let _ = events.send(PeerEvent::Data {
                peer,
                connection,
                payload: message.data,
            });
        })
    }));
}

/// One `RTCPeerConnection` with at most one data channel
struct WebRtcPeer {
    peer: PeerId,
    connection: ConnectionId,
    pc: Arc<RTCPeerConnection>,
    channel: ChannelSlot,
    events: mpsc::UnboundedSender<PeerEvent>,
}

#[async_trait]
impl PeerTransport for WebRtcPeer {
    async fn create_data_channel(&self, label: &str) -> Result<()> {
        let dc = self.pc.create_data_channel(label, None).await.map_err(peer_error)?;
        attach_channel(&dc, self.peer.clone(), self.connection, self.events.clone());
        *self.channel.lock().await = Some(dc);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await.map_err(peer_error)?;
        let sdp = offer.sdp.clone();
        self.pc.set_local_description(offer).await.map_err(peer_error)?;
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await.map_err(peer_error)?;
        let sdp = answer.sdp.clone();
        self.pc.set_local_description(answer).await.map_err(peer_error)?;
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let description = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(peer_error)?;
        self.pc.set_remote_description(description).await.map_err(peer_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: Some(candidate.sdp_mline_index),
                username_fragment: None,
            })
            .await
            .map_err(peer_error)
    }

    async fn send(&self, payload: Bytes) -> Result<()> {
        let channel = self.channel.lock().await;
        let dc = channel
            .as_ref()
            .ok_or_else(|| Error::Peer(format!("no data channel to `{}`", self.peer)))?;
        dc.send(&payload).await.map_err(peer_error)?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(dc) = self.channel.lock().await.take() {
            dc.close().await.map_err(peer_error)?;
        }
        self.pc.close().await.map_err(peer_error)
    }
}
