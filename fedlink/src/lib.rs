//! # fedlink
//!
//! **Federated-learning client: cycle negotiation, diff reporting and peer signaling.**
//!
//! A device joins a coordinator-managed training cycle by passing an
//! admission check, authenticating, optionally probing its connection,
//! asking for a cycle and downloading the plan and model. Once training is
//! done the client reports the difference between the downloaded and the
//! trained parameters. Devices in the same scope can also open direct data
//! channels, using the coordinator only as a signaling relay.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use fedlink::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> fedlink::Result<()> {
//!     let client = FedClient::builder().build();
//!     let config = JobConfig::builder("wss://grid.example", "mnist", "1.0.0")
//!         .auth_token("token")
//!         .build()?;
//!     let job = client.new_job(config)?;
//!
//!     match job.start(true, true).outcome().await {
//!         JobOutcome::Ready(cycle) => {
//!             let summary = cycle.train(executor, batches, Deadline::new()).await?;
//!             cycle.report_updated(&summary.params).await?;
//!         }
//!         JobOutcome::Rejected { timeout } => println!("come back in {timeout:?}"),
//!         JobOutcome::Failed(err) => return Err(err),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - `webrtc`: `peer::webrtc::WebRtcFactory`, a peer backend on the `webrtc` crate
//!
//! ## Crate Structure
//!
//! - [`fedlink_core`]: identifiers, configuration, state machine, errors
//! - [`fedlink_net`]: wire payloads, transports and the signaling channel
//! - [`fedlink_runtime`]: clock and cooperative deadline
//! - [`fedlink_models`]: model state, diff builder, executor seam

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

// Re-export sub-crates
pub use fedlink_core as core;
pub use fedlink_models as models;
pub use fedlink_net as net;
pub use fedlink_runtime as runtime;

pub use fedlink_core::{Error, ErrorKind, Result};

pub mod admission;
pub mod fetch;
pub mod job;
pub mod metrics;
pub mod peer;
pub mod session;

use fedlink_core::config::{JobConfig, TransportKind};
use fedlink_core::identity::{ProtocolId, ScopeId, WorkerId};
use fedlink_core::traits::{DeviceMonitor, StaticDevice};
use fedlink_models::{ModelCodec, PostcardCodec};
use fedlink_net::channel::{SignalingChannel, DEFAULT_KEEP_ALIVE};
use fedlink_net::http::{HttpTransport, DEFAULT_API_PREFIX, DEFAULT_UPLOAD_PROBE_BYTES};
use fedlink_net::socket::SocketTransport;
use fedlink_net::traits::CoordinatorTransport;
use fedlink_runtime::{Clock, SystemClock};

use crate::job::Job;
use crate::metrics::{HostProbe, TcpHostProbe};
use crate::peer::{PeerTransportFactory, DEFAULT_ICE_SERVERS};
use crate::session::PeerSession;

/// Prelude module for convenient imports
///
/// ```rust,ignore
/// use fedlink::prelude::*;
/// ```
pub mod prelude {
    pub use crate::core::prelude::*;
    pub use crate::models::prelude::*;
    pub use crate::net::prelude::*;
    pub use crate::runtime::{Clock, Deadline};

    pub use crate::job::{DiffReporter, Job, JobOutcome, JobRun, ReadyCycle};
    pub use crate::peer::{PeerData, PeerEngineHandle, PeerNegotiationEngine};
    pub use crate::session::PeerSession;
    pub use crate::{ClientSettings, FedClient};
}

/// Settings shared by every job a [`FedClient`] creates
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Path segment between the endpoint and each HTTP call
    pub api_prefix: String,
    /// Signaling keep-alive interval
    pub keep_alive: Duration,
    /// Size of the upload speed probe
    pub upload_probe_bytes: usize,
    /// Per-request HTTP timeout; none by default
    pub request_timeout: Option<Duration>,
    /// STUN/TURN URLs for peer connections
    pub ice_servers: Vec<String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_prefix: DEFAULT_API_PREFIX.to_string(),
            keep_alive: DEFAULT_KEEP_ALIVE,
            upload_probe_bytes: DEFAULT_UPLOAD_PROBE_BYTES,
            request_timeout: None,
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Builder for [`FedClient`]
pub struct FedClientBuilder {
    settings: ClientSettings,
    device: Arc<dyn DeviceMonitor>,
    codec: Arc<dyn ModelCodec>,
    clock: Arc<dyn Clock>,
    host_probe: Arc<dyn HostProbe>,
}

impl Default for FedClientBuilder {
    fn default() -> Self {
        Self {
            settings: ClientSettings::default(),
            device: Arc::new(StaticDevice::plugged_in()),
            codec: Arc::new(PostcardCodec),
            clock: Arc::new(SystemClock::new()),
            host_probe: Arc::new(TcpHostProbe::default()),
        }
    }
}

impl FedClientBuilder {
    /// Create a builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all settings at once
    pub fn settings(mut self, settings: ClientSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the HTTP path prefix
    pub fn api_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.settings.api_prefix = prefix.into();
        self
    }

    /// Set the signaling keep-alive interval
    pub fn keep_alive(mut self, interval: Duration) -> Self {
        self.settings.keep_alive = interval;
        self
    }

    /// Set the upload probe size
    pub fn upload_probe_bytes(mut self, bytes: usize) -> Self {
        self.settings.upload_probe_bytes = bytes;
        self
    }

    /// Set a per-request HTTP timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.settings.request_timeout = Some(timeout);
        self
    }

    /// Set the ICE servers for peer connections
    pub fn ice_servers(mut self, servers: Vec<String>) -> Self {
        self.settings.ice_servers = servers;
        self
    }

    /// Set the device status source
    pub fn device(mut self, device: Arc<dyn DeviceMonitor>) -> Self {
        self.device = device;
        self
    }

    /// Set the model container format
    pub fn codec(mut self, codec: Arc<dyn ModelCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Set the clock used for metrics probes
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the ping probe used by HTTP jobs
    pub fn host_probe(mut self, host_probe: Arc<dyn HostProbe>) -> Self {
        self.host_probe = host_probe;
        self
    }

    /// Build the client
    pub fn build(self) -> FedClient {
        FedClient {
            settings: self.settings,
            device: self.device,
            codec: self.codec,
            clock: self.clock,
            host_probe: self.host_probe,
        }
    }
}

/// Entry point: creates jobs and peer sessions with shared settings
#[derive(Clone)]
pub struct FedClient {
    settings: ClientSettings,
    device: Arc<dyn DeviceMonitor>,
    codec: Arc<dyn ModelCodec>,
    clock: Arc<dyn Clock>,
    host_probe: Arc<dyn HostProbe>,
}

impl std::fmt::Debug for FedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FedClient")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl FedClient {
    /// Create a new client builder
    pub fn builder() -> FedClientBuilder {
        FedClientBuilder::new()
    }

    /// Client settings
    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Create a job with its own transports.
    ///
    /// `http`/`https` endpoints use HTTP for everything. `ws`/`wss` endpoints
    /// run the session over a signaling channel and download artifacts from
    /// the endpoint's HTTP counterpart.
    pub fn new_job(&self, config: JobConfig) -> Result<Job> {
        let http = Arc::new(self.http_transport(&config.endpoint)?);
        let transport: Arc<dyn CoordinatorTransport> = match config.transport_kind {
            TransportKind::Http => http.clone(),
            TransportKind::Socket => Arc::new(SocketTransport::new(self.signaling_channel(&config.endpoint))),
        };
        tracing::debug!(endpoint = %config.endpoint, kind = ?config.transport_kind, "job transports selected");
        Job::builder(config)
            .transport(transport)
            .artifacts(http.clone())
            .speed_test(http)
            .device(self.device.clone())
            .host_probe(self.host_probe.clone())
            .clock(self.clock.clone())
            .codec(self.codec.clone())
            .build()
    }

    /// A disconnected signaling channel for `endpoint` with the client's keep-alive
    pub fn signaling_channel(&self, endpoint: &str) -> SignalingChannel {
        SignalingChannel::websocket(endpoint.trim_end_matches('/'), self.settings.keep_alive)
    }

    /// Join a peer scope over a fresh signaling channel
    pub async fn peer_session(
        &self,
        endpoint: &str,
        worker_id: WorkerId,
        scope_id: ScopeId,
        protocol_id: ProtocolId,
        factory: Arc<dyn PeerTransportFactory>,
    ) -> Result<PeerSession> {
        if TransportKind::from_endpoint(endpoint)? != TransportKind::Socket {
            return Err(Error::Config(format!(
                "peer sessions need a ws:// or wss:// endpoint, got `{endpoint}`"
            )));
        }
        PeerSession::join(self.signaling_channel(endpoint), worker_id, scope_id, protocol_id, factory).await
    }

    /// WebRTC peer backend using the configured ICE servers
    #[cfg(feature = "webrtc")]
    pub fn webrtc_factory(&self) -> Arc<dyn PeerTransportFactory> {
        Arc::new(peer::webrtc::WebRtcFactory::new(self.settings.ice_servers.clone()))
    }

    fn http_transport(&self, endpoint: &str) -> Result<HttpTransport> {
        let mut client = reqwest::Client::builder();
        if let Some(timeout) = self.settings.request_timeout {
            client = client.timeout(timeout);
        }
        let client = client
            .build()
            .map_err(|e| Error::Config(format!("http client: {e}")))?;
        Ok(HttpTransport::new(endpoint)?
            .with_client(client)
            .with_api_prefix(self.settings.api_prefix.clone())
            .with_upload_probe_bytes(self.settings.upload_probe_bytes))
    }
}
