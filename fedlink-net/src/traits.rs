//! Transport traits
//!
//! The coordinator session, artifact downloads, speed tests and the raw
//! persistent socket each sit behind their own trait so jobs can mix a
//! socket session with HTTP downloads, and tests can swap in mocks.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fedlink_core::config::TransportKind;
use fedlink_core::identity::WorkerId;
use futures::{Sink, Stream};

use crate::protocol::{
    ArtifactRequest, AuthReply, AuthRequest, CycleRequest, CycleResponse, ReportReply, ReportRequest,
};
use crate::Result;

/// Session calls made by a job against the coordinator
#[async_trait]
pub trait CoordinatorTransport: Send + Sync {
    /// Obtain a worker id
    async fn authenticate(&self, request: &AuthRequest) -> Result<AuthReply>;

    /// Ask for admission to the current cycle
    async fn cycle_request(&self, request: &CycleRequest) -> Result<CycleResponse>;

    /// Submit a computed diff
    async fn report(&self, request: &ReportRequest) -> Result<ReportReply>;

    /// Which kind of transport this is
    fn kind(&self) -> TransportKind;

    /// Fixed round-trip estimate, when the transport has one
    fn round_trip_estimate(&self) -> Option<Duration> {
        None
    }

    /// Close any persistent connection. The next call opens a new one.
    async fn release(&self) {}
}

/// Downloads plans and models
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Fetch an artifact's raw bytes
    async fn fetch(&self, request: &ArtifactRequest) -> Result<Bytes>;
}

/// Coordinator-assisted bandwidth probes
#[async_trait]
pub trait SpeedTest: Send + Sync {
    /// Download a probe payload, returning the number of bytes received
    async fn download_probe(&self, worker_id: &WorkerId) -> Result<u64>;

    /// Upload a probe payload, returning the number of bytes sent
    async fn upload_probe(&self, worker_id: &WorkerId) -> Result<u64>;
}

/// Outgoing text frames of a persistent socket
pub type FrameSink = Pin<Box<dyn Sink<String, Error = crate::Error> + Send>>;

/// Incoming text frames of a persistent socket
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Opens persistent sockets
#[async_trait]
pub trait SocketConnector: Send + Sync {
    /// Connect to `url` and split the socket into sink and stream halves
    async fn connect(&self, url: &str) -> Result<(FrameSink, FrameStream)>;
}
