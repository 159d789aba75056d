//! Connection quality figures reported with a cycle request

use serde::{Deserialize, Serialize};

/// Connection quality probed before requesting a cycle
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    /// Round-trip latency in milliseconds
    pub ping_millis: f64,
    /// Upload throughput in megabytes per second
    pub upload_mbps: f64,
    /// Download throughput in megabytes per second
    pub download_mbps: f64,
}

/// Throughput in megabytes per second for `bytes` moved in `elapsed_ms`.
///
/// A zero elapsed time is clamped to one millisecond.
pub fn throughput_mbps(bytes: u64, elapsed_ms: u64) -> f64 {
    let seconds = elapsed_ms.max(1) as f64 / 1000.0;
    bytes as f64 / seconds / 1024.0 / 1024.0
}
