//! Mock transports for testing
//!
//! - [`MockConnector`] / [`MockSocketServer`]: an in-memory socket pair
//! - [`MockCoordinator`]: a scripted coordinator with call recording

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fedlink_core::config::{ClientConfig, TransportKind};
use fedlink_core::identity::{ArtifactId, RequestKey, WorkerId};
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;

use crate::protocol::{
    ArtifactKind, ArtifactRequest, AuthReply, AuthRequest, AuthResponse, CycleAccepted, CycleRequest,
    CycleResponse, ReportReply, ReportRequest,
};
use crate::traits::{ArtifactSource, CoordinatorTransport, FrameSink, FrameStream, SocketConnector, SpeedTest};
use crate::{Error, Result};

type ClientEnds = (UnboundedSender<String>, UnboundedReceiver<String>);

/// Connector handing out one in-memory socket
#[derive(Debug)]
pub struct MockConnector {
    slot: StdMutex<Option<ClientEnds>>,
}

/// Server side of a [`MockConnector`] socket
#[derive(Debug)]
pub struct MockSocketServer {
    to_client: StdMutex<Option<UnboundedSender<String>>>,
    from_client: Mutex<UnboundedReceiver<String>>,
}

impl MockConnector {
    /// Create a connector and the server end of its socket
    pub fn new() -> (Self, MockSocketServer) {
        let (client_tx, server_rx) = unbounded();
        let (server_tx, client_rx) = unbounded();
        let connector = Self {
            slot: StdMutex::new(Some((client_tx, client_rx))),
        };
        let server = MockSocketServer {
            to_client: StdMutex::new(Some(server_tx)),
            from_client: Mutex::new(server_rx),
        };
        (connector, server)
    }
}

#[async_trait]
impl SocketConnector for MockConnector {
    async fn connect(&self, _url: &str) -> Result<(FrameSink, FrameStream)> {
        let ends = self.slot.lock().ok().and_then(|mut slot| slot.take());
        let (tx, rx) = ends.ok_or_else(|| Error::ConnectionFailed("mock socket already used".into()))?;
        let sink: FrameSink = Box::pin(tx.sink_map_err(|_| Error::Closed));
        let stream: FrameStream = Box::pin(rx.map(Ok::<String, Error>));
        Ok((sink, stream))
    }
}

impl MockSocketServer {
    /// Deliver a text frame to the client
    pub fn push(&self, frame: impl Into<String>) {
        if let Ok(guard) = self.to_client.lock() {
            if let Some(tx) = guard.as_ref() {
                let _ = tx.unbounded_send(frame.into());
            }
        }
    }

    /// Close the server side, ending the client's stream
    pub fn hang_up(&self) {
        if let Ok(mut guard) = self.to_client.lock() {
            guard.take();
        }
    }

    /// Wait for the next frame written by the client
    pub async fn next_frame(&self) -> Option<String> {
        self.from_client.lock().await.next().await
    }

    /// Drain every frame written so far without waiting
    pub fn drain_frames(&self) -> Vec<String> {
        let mut frames = Vec::new();
        if let Ok(mut rx) = self.from_client.try_lock() {
            while let Ok(Some(frame)) = rx.try_next() {
                frames.push(frame);
            }
        }
        frames
    }
}

/// Scripted coordinator implementing every transport trait
#[derive(Debug)]
pub struct MockCoordinator {
    auth: AuthReply,
    cycle: CycleResponse,
    artifacts: HashMap<(ArtifactKind, String), Bytes>,
    probe_bytes: u64,
    round_trip: Option<Duration>,
    fail_on: Option<&'static str>,
    calls: StdMutex<Vec<&'static str>>,
    cycle_requests: StdMutex<Vec<CycleRequest>>,
    reports: StdMutex<Vec<ReportRequest>>,
}

impl MockCoordinator {
    /// A coordinator with fixed replies
    pub fn new(auth: AuthReply, cycle: CycleResponse) -> Self {
        Self {
            auth,
            cycle,
            artifacts: HashMap::new(),
            probe_bytes: 1024 * 1024,
            round_trip: None,
            fail_on: None,
            calls: StdMutex::new(Vec::new()),
            cycle_requests: StdMutex::new(Vec::new()),
            reports: StdMutex::new(Vec::new()),
        }
    }

    /// A coordinator that authenticates `worker_id` and accepts its cycle
    /// with plan `1` and model `2`
    pub fn accepting(worker_id: &str, request_key: &str, client_config: ClientConfig) -> Self {
        Self::new(
            AuthReply::Accepted(AuthResponse {
                worker_id: WorkerId::new(worker_id),
                requires_speed_test: false,
            }),
            CycleResponse::Accepted(CycleAccepted {
                status: "accepted".into(),
                request_key: RequestKey::new(request_key),
                training_plan: ArtifactId::new("1"),
                client_config,
                protocol: None,
                model: ArtifactId::new("2"),
            }),
        )
    }

    /// Ask for (or skip) the speed test in the authentication reply
    pub fn with_speed_test(mut self, required: bool) -> Self {
        if let AuthReply::Accepted(ref mut response) = self.auth {
            response.requires_speed_test = required;
        }
        self
    }

    /// Replace the cycle reply
    pub fn with_cycle(mut self, cycle: CycleResponse) -> Self {
        self.cycle = cycle;
        self
    }

    /// Serve `bytes` for an artifact
    pub fn with_artifact(mut self, kind: ArtifactKind, id: &str, bytes: impl Into<Bytes>) -> Self {
        self.artifacts.insert((kind, id.to_string()), bytes.into());
        self
    }

    /// Report a fixed round-trip estimate
    pub fn with_round_trip(mut self, round_trip: Duration) -> Self {
        self.round_trip = Some(round_trip);
        self
    }

    /// Bytes moved by each speed probe
    pub fn with_probe_bytes(mut self, bytes: u64) -> Self {
        self.probe_bytes = bytes;
        self
    }

    /// Fail the named call with a connection error
    pub fn failing_on(mut self, call: &'static str) -> Self {
        self.fail_on = Some(call);
        self
    }

    /// Calls made so far, in order
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Cycle requests received so far
    pub fn cycle_requests(&self) -> Vec<CycleRequest> {
        self.cycle_requests.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Reports received so far
    pub fn reports(&self) -> Vec<ReportRequest> {
        self.reports.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn record(&self, call: &'static str) -> Result<()> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
        if self.fail_on == Some(call) {
            return Err(Error::ConnectionFailed(format!("mock failure on {call}")));
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinatorTransport for MockCoordinator {
    async fn authenticate(&self, _request: &AuthRequest) -> Result<AuthReply> {
        self.record("authenticate")?;
        Ok(self.auth.clone())
    }

    async fn cycle_request(&self, request: &CycleRequest) -> Result<CycleResponse> {
        self.record("cycle_request")?;
        if let Ok(mut requests) = self.cycle_requests.lock() {
            requests.push(request.clone());
        }
        Ok(self.cycle.clone())
    }

    async fn report(&self, request: &ReportRequest) -> Result<ReportReply> {
        self.record("report")?;
        if let Ok(mut reports) = self.reports.lock() {
            reports.push(request.clone());
        }
        Ok(ReportReply {
            status: Some("success".into()),
            error: None,
        })
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    fn round_trip_estimate(&self) -> Option<Duration> {
        self.round_trip
    }
}

#[async_trait]
impl ArtifactSource for MockCoordinator {
    async fn fetch(&self, request: &ArtifactRequest) -> Result<Bytes> {
        self.record(match request.kind {
            ArtifactKind::Plan => "fetch_plan",
            ArtifactKind::Model => "fetch_model",
        })?;
        self.artifacts
            .get(&(request.kind, request.artifact_id.to_string()))
            .cloned()
            .ok_or(Error::Status {
                status: 404,
                body: format!("no {} {}", request.kind.id_param(), request.artifact_id),
            })
    }
}

#[async_trait]
impl SpeedTest for MockCoordinator {
    async fn download_probe(&self, _worker_id: &WorkerId) -> Result<u64> {
        self.record("download_probe")?;
        Ok(self.probe_bytes)
    }

    async fn upload_probe(&self, _worker_id: &WorkerId) -> Result<u64> {
        self.record("upload_probe")?;
        Ok(self.probe_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_socket_connects_once() {
        let (connector, server) = MockConnector::new();
        let (mut sink, mut stream) = connector.connect("ws://mock").await.unwrap();
        assert!(connector.connect("ws://mock").await.is_err());

        sink.send("hello".to_string()).await.unwrap();
        assert_eq!(server.next_frame().await.as_deref(), Some("hello"));

        server.push("world");
        assert_eq!(stream.next().await.unwrap().unwrap(), "world");
        server.hang_up();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn mock_coordinator_records_calls_and_failures() {
        let coordinator = MockCoordinator::new(
            AuthReply::Accepted(AuthResponse {
                worker_id: WorkerId::new("w"),
                requires_speed_test: false,
            }),
            CycleResponse::Rejected(crate::protocol::CycleRejected {
                status: "rejected".into(),
                timeout: None,
                error: None,
            }),
        )
        .failing_on("download_probe");

        let request = AuthRequest {
            auth_token: None,
            model_name: "m".into(),
            model_version: "1".into(),
        };
        coordinator.authenticate(&request).await.unwrap();
        assert!(coordinator.download_probe(&WorkerId::new("w")).await.is_err());
        assert_eq!(coordinator.calls(), vec!["authenticate", "download_probe"]);
    }
}
