//! Connection metrics prober
//!
//! Measures ping, download and upload before a cycle request when the
//! coordinator asks for it. Download and upload run concurrently; ping is the
//! transport's own round-trip estimate when it has one, otherwise a timed TCP
//! reachability check against the endpoint host.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fedlink_core::identity::WorkerId;
use fedlink_core::metrics::{throughput_mbps, ConnectionMetrics};
use fedlink_core::{Error, Result};
use fedlink_net::traits::SpeedTest;
use fedlink_runtime::Clock;

/// Reachability check used to time a ping
#[async_trait]
pub trait HostProbe: Send + Sync {
    /// Succeed once `endpoint`'s host accepts a connection
    async fn reach(&self, endpoint: &str) -> Result<()>;
}

/// Default reachability timeout
pub const DEFAULT_REACH_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens (and immediately drops) a TCP connection to the endpoint host
#[derive(Debug, Clone, Copy)]
pub struct TcpHostProbe {
    timeout: Duration,
}

impl TcpHostProbe {
    /// Probe with a custom connect timeout
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpHostProbe {
    fn default() -> Self {
        Self::with_timeout(DEFAULT_REACH_TIMEOUT)
    }
}

/// `host:port` of an endpoint URL, filling in the scheme's default port
pub fn socket_address(endpoint: &str) -> Result<String> {
    let (scheme, rest) = endpoint
        .split_once("://")
        .ok_or_else(|| Error::Config(format!("endpoint `{endpoint}` has no scheme")))?;
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    if authority.is_empty() {
        return Err(Error::Config(format!("endpoint `{endpoint}` has no host")));
    }

    // A trailing `]` means an IPv6 literal without a port.
    let has_port = authority
        .rsplit_once(':')
        .map(|(_, port)| !port.ends_with(']') && port.parse::<u16>().is_ok())
        .unwrap_or(false);
    if has_port {
        return Ok(authority.to_string());
    }
    let port = match scheme.to_ascii_lowercase().as_str() {
        "http" | "ws" => 80,
        "https" | "wss" => 443,
        other => return Err(Error::Config(format!("unsupported endpoint scheme `{other}`"))),
    };
    Ok(format!("{authority}:{port}"))
}

#[async_trait]
impl HostProbe for TcpHostProbe {
    async fn reach(&self, endpoint: &str) -> Result<()> {
        let address = socket_address(endpoint)?;
        match tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect(&address)).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(Error::network(format!("{address} unreachable: {e}"))),
            Err(_) => Err(Error::network(format!("{address} did not answer within {:?}", self.timeout))),
        }
    }
}

/// Probes connection quality for a cycle request
#[derive(Clone)]
pub struct ConnectionMetricsProber {
    host_probe: Arc<dyn HostProbe>,
    clock: Arc<dyn Clock>,
}

impl core::fmt::Debug for ConnectionMetricsProber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConnectionMetricsProber")
            .field("now", &self.clock.now())
            .finish_non_exhaustive()
    }
}

impl ConnectionMetricsProber {
    /// Create a prober timing everything with `clock`
    pub fn new(host_probe: Arc<dyn HostProbe>, clock: Arc<dyn Clock>) -> Self {
        Self { host_probe, clock }
    }

    /// Round-trip time to the endpoint host in milliseconds
    pub async fn ping(&self, endpoint: &str) -> Result<f64> {
        let started = self.clock.now();
        self.host_probe.reach(endpoint).await?;
        Ok(self.clock.elapsed_since(started) as f64)
    }

    /// Measure all three figures.
    ///
    /// `round_trip` short-circuits the ping when the transport already knows it.
    pub async fn probe(
        &self,
        endpoint: &str,
        worker_id: &WorkerId,
        speed_test: &dyn SpeedTest,
        round_trip: Option<Duration>,
    ) -> Result<ConnectionMetrics> {
        let ping_millis = match round_trip {
            Some(round_trip) => round_trip.as_secs_f64() * 1000.0,
            None => self.ping(endpoint).await?,
        };

        let download = async {
            let started = self.clock.now();
            let bytes = speed_test.download_probe(worker_id).await?;
            Ok::<_, Error>(throughput_mbps(bytes, self.clock.elapsed_since(started)))
        };
        let upload = async {
            let started = self.clock.now();
            let bytes = speed_test.upload_probe(worker_id).await?;
            Ok::<_, Error>(throughput_mbps(bytes, self.clock.elapsed_since(started)))
        };
        let (download_mbps, upload_mbps) = futures::try_join!(download, upload)?;

        let metrics = ConnectionMetrics {
            ping_millis,
            upload_mbps,
            download_mbps,
        };
        tracing::debug!(
            worker_id = %worker_id,
            ping_ms = metrics.ping_millis,
            download_mbps = metrics.download_mbps,
            upload_mbps = metrics.upload_mbps,
            "connection metrics probed"
        );
        Ok(metrics)
    }
}
