//! Coordinator session over the signaling channel
//!
//! [`SocketTransport`] sends each session request as a signaling message and
//! waits for the first response of the same type. [`WebSocketConnector`]
//! (feature `websocket`) opens the real socket.

use std::time::Duration;

use async_trait::async_trait;
use fedlink_core::config::TransportKind;
use tokio::sync::broadcast::error::RecvError;

use crate::channel::SignalingChannel;
use crate::protocol::{AuthReply, AuthRequest, CycleRequest, CycleResponse, ReportReply, ReportRequest};
use crate::signaling::SignalingMessage;
use crate::traits::CoordinatorTransport;
use crate::{Error, Result};

/// Coordinator transport multiplexed over a [`SignalingChannel`]
#[derive(Debug, Clone)]
pub struct SocketTransport {
    channel: SignalingChannel,
}

impl SocketTransport {
    /// Wrap a (possibly not yet connected) channel
    pub fn new(channel: SignalingChannel) -> Self {
        Self { channel }
    }

    /// The underlying channel
    pub fn channel(&self) -> &SignalingChannel {
        &self.channel
    }

    async fn exchange<T: Send>(
        &self,
        request: SignalingMessage,
        accept: impl Fn(SignalingMessage) -> Option<T> + Send,
    ) -> Result<T> {
        // Subscribe before sending so the response cannot be missed.
        let mut inbound = self.channel.subscribe();
        self.channel.connect().await?;
        self.channel.send(&request).await?;

        let closed = self.channel.closed();
        tokio::pin!(closed);
        loop {
            tokio::select! {
                received = inbound.recv() => match received {
                    Ok(message) => {
                        if let Some(value) = accept(message) {
                            return Ok(value);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "socket transport lagged behind inbound messages");
                    }
                    Err(RecvError::Closed) => return Err(Error::Closed),
                },
                _ = &mut closed => return Err(Error::Closed),
            }
        }
    }
}

#[async_trait]
impl CoordinatorTransport for SocketTransport {
    async fn authenticate(&self, request: &AuthRequest) -> Result<AuthReply> {
        self.exchange(SignalingMessage::AuthRequest(request.clone()), |m| match m {
            SignalingMessage::AuthResponse(reply) => Some(reply),
            _ => None,
        })
        .await
    }

    async fn cycle_request(&self, request: &CycleRequest) -> Result<CycleResponse> {
        self.exchange(SignalingMessage::CycleRequest(request.clone()), |m| match m {
            SignalingMessage::CycleResponse(response) => Some(response),
            _ => None,
        })
        .await
    }

    async fn report(&self, request: &ReportRequest) -> Result<ReportReply> {
        self.exchange(SignalingMessage::ReportRequest(request.clone()), |m| match m {
            SignalingMessage::ReportResponse(reply) => Some(reply),
            _ => None,
        })
        .await
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    fn round_trip_estimate(&self) -> Option<Duration> {
        self.channel.round_trip_estimate()
    }

    async fn release(&self) {
        self.channel.disconnect().await;
    }
}

#[cfg(feature = "websocket")]
pub use self::websocket::WebSocketConnector;

#[cfg(feature = "websocket")]
mod websocket {
    use async_trait::async_trait;
    use futures::{future, SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    use crate::traits::{FrameSink, FrameStream, SocketConnector};
    use crate::{Error, Result};

    /// Opens `ws://` and `wss://` sockets with `tokio-tungstenite`
    #[derive(Debug, Clone, Copy, Default)]
    pub struct WebSocketConnector;

    #[async_trait]
    impl SocketConnector for WebSocketConnector {
        async fn connect(&self, url: &str) -> Result<(FrameSink, FrameStream)> {
            let (ws_stream, _response) = tokio_tungstenite::connect_async(url)
                .await
                .map_err(|e| Error::ConnectionFailed(e.to_string()))?;
            let (sink, stream) = ws_stream.split();

            let sink = sink
                .with(|text: String| future::ready(Ok::<_, tokio_tungstenite::tungstenite::Error>(Message::Text(text))))
                .sink_map_err(|e| Error::WebSocket(e.to_string()));

            let stream = stream.filter_map(|message| {
                future::ready(match message {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => Some(Ok(text)),
                        Err(_) => {
                            tracing::warn!("dropping non-utf8 binary frame");
                            None
                        }
                    },
                    // Pings are answered by tungstenite on the next write.
                    Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
                    Ok(Message::Close(_)) => None,
                    Err(e) => Some(Err(Error::WebSocket(e.to_string()))),
                })
            });

            let sink: FrameSink = Box::pin(sink);
            let stream: FrameStream = Box::pin(stream);
            Ok((sink, stream))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::mock::MockConnector;
    use crate::protocol::{AuthResponse, CycleRejected};
    use fedlink_core::identity::WorkerId;

    fn transport() -> (SocketTransport, Arc<crate::mock::MockSocketServer>) {
        let (connector, server) = MockConnector::new();
        let channel = SignalingChannel::new("ws://mock", Arc::new(connector));
        (SocketTransport::new(channel), Arc::new(server))
    }

    #[tokio::test]
    async fn authenticate_waits_for_matching_response() {
        let (transport, server) = transport();
        let responder = {
            let server = server.clone();
            tokio::spawn(async move {
                let frame = server.next_frame().await.unwrap();
                assert!(matches!(
                    SignalingMessage::decode(&frame).unwrap(),
                    SignalingMessage::AuthRequest(_)
                ));
                // Unrelated traffic first; the transport must skip it.
                server.push(r#"{"type":"webrtc: join-room","data":{"workerId":"x","scopeId":"s"}}"#);
                server.push(r#"{"type":"federated/authenticate","data":{"worker_id":"w-9","requires_speed_test":false}}"#);
            })
        };

        let reply = transport
            .authenticate(&AuthRequest {
                auth_token: Some("t".into()),
                model_name: "mnist".into(),
                model_version: "1.0.0".into(),
            })
            .await
            .unwrap();
        responder.await.unwrap();
        assert_eq!(
            reply,
            AuthReply::Accepted(AuthResponse {
                worker_id: WorkerId::new("w-9"),
                requires_speed_test: false,
            })
        );
        assert_eq!(transport.kind(), TransportKind::Socket);
        assert!(transport.round_trip_estimate().is_some());
    }

    #[tokio::test]
    async fn cycle_request_decodes_rejection() {
        let (transport, server) = transport();
        let responder = {
            let server = server.clone();
            tokio::spawn(async move {
                server.next_frame().await.unwrap();
                server.push(r#"{"type":"federated/cycle-request","data":{"status":"rejected","timeout":60}}"#);
            })
        };
        let response = transport
            .cycle_request(&CycleRequest {
                worker_id: WorkerId::new("w"),
                model: "mnist".into(),
                version: "1.0.0".into(),
                ping: None,
                download: None,
                upload: None,
            })
            .await
            .unwrap();
        responder.await.unwrap();
        assert_eq!(
            response,
            CycleResponse::Rejected(CycleRejected {
                status: "rejected".into(),
                timeout: Some(60.0),
                error: None,
            })
        );
    }

    #[tokio::test]
    async fn hang_up_fails_pending_request() {
        let (transport, server) = transport();
        let responder = {
            let server = server.clone();
            tokio::spawn(async move {
                server.next_frame().await.unwrap();
                server.hang_up();
            })
        };
        let result = transport
            .report(&ReportRequest {
                worker_id: WorkerId::new("w"),
                request_key: fedlink_core::identity::RequestKey::new("k"),
                diff: String::new(),
            })
            .await;
        responder.await.unwrap();
        assert!(matches!(result, Err(Error::Closed)));
    }
}
