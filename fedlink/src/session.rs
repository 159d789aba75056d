//! Peer session wiring
//!
//! [`PeerSession::join`] looks up the scope's protocol, announces the worker
//! with `join-room`, and then runs a [`PeerNegotiationEngine`] on the channel
//! until [`PeerSession::stop`].

use std::sync::Arc;

use fedlink_core::identity::{PeerId, ProtocolId, ScopeId, WorkerId};
use fedlink_core::Result;
use fedlink_net::channel::SignalingChannel;
use fedlink_net::signaling::{GetProtocol, RoomMembership, SignalingMessage};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::peer::{PeerEngineHandle, PeerNegotiationEngine, PeerTransportFactory};

/// A worker's membership in one peer scope
#[derive(Debug)]
pub struct PeerSession {
    channel: SignalingChannel,
    engine: PeerEngineHandle,
    forwarder: JoinHandle<()>,
    protocol: Value,
}

impl PeerSession {
    /// Connect, fetch the protocol, join the scope and start negotiating
    pub async fn join(
        channel: SignalingChannel,
        worker_id: WorkerId,
        scope_id: ScopeId,
        protocol_id: ProtocolId,
        factory: Arc<dyn PeerTransportFactory>,
    ) -> Result<Self> {
        // The same subscription later feeds the engine, so nothing sent
        // after join-room can be missed.
        let mut inbound = channel.subscribe();
        channel.connect().await?;
        channel
            .send(&SignalingMessage::GetProtocolRequest(GetProtocol {
                worker_id: worker_id.clone(),
                scope_id: scope_id.clone(),
                protocol_id: protocol_id.clone(),
            }))
            .await?;

        let protocol = {
            // Scoped so the borrow of `channel` ends before it moves into the session.
            let closed = channel.closed();
            tokio::pin!(closed);
            loop {
                tokio::select! {
                    received = inbound.recv() => match received {
                        Ok(SignalingMessage::GetProtocolResponse(protocol)) => break protocol,
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "peer session lagged waiting for protocol");
                        }
                        Err(RecvError::Closed) => return Err(fedlink_net::Error::Closed.into()),
                    },
                    _ = &mut closed => return Err(fedlink_net::Error::Closed.into()),
                }
            }
        };
        tracing::info!(worker_id = %worker_id, scope = %scope_id, protocol = %protocol_id, "protocol received");

        let local_id = PeerId::from(&worker_id);
        channel
            .send(&SignalingMessage::JoinRoom(RoomMembership {
                worker_id: local_id.clone(),
                scope_id: scope_id.clone(),
            }))
            .await?;

        let (outbound, queue) = mpsc::unbounded_channel();
        let engine = PeerNegotiationEngine::new(local_id, scope_id, factory, outbound).spawn(inbound);
        let forwarder = tokio::spawn(forward_outbound(channel.clone(), queue));
        Ok(Self {
            channel,
            engine,
            forwarder,
            protocol,
        })
    }

    /// Protocol returned by the coordinator, as received
    pub fn protocol(&self) -> &Value {
        &self.protocol
    }

    /// The running engine
    pub fn engine(&self) -> &PeerEngineHandle {
        &self.engine
    }

    /// Close every peer connection and disconnect the channel
    pub async fn stop(self) {
        self.engine.shutdown().await;
        // The engine dropped its outbound sender, so the forwarder drains and ends.
        if let Err(e) = self.forwarder.await {
            tracing::warn!(error = %e, "signaling forwarder failed");
        }
        self.channel.disconnect().await;
    }
}

async fn forward_outbound(channel: SignalingChannel, mut queue: mpsc::UnboundedReceiver<SignalingMessage>) {
    while let Some(message) = queue.recv().await {
        if let Err(e) = channel.send(&message).await {
            tracing::warn!(kind = message.message_type(), error = %e, "peer signaling not sent");
        }
    }
}
