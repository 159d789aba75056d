//! # fedlink Network
//!
//! Coordinator transports and the signaling channel.
//!
//! This crate provides:
//! - Session payloads exchanged with the coordinator ([`protocol`])
//! - The [`signaling::SignalingMessage`] codec
//! - Transport traits for session calls, artifact downloads and speed tests
//! - An HTTP transport (`http` feature) and a WebSocket connector (`websocket` feature)
//! - [`channel::SignalingChannel`]: persistent channel with keep-alive and fan-out
//! - In-memory mocks for tests
//!
//! ## Feature Flags
//!
//! - `http` (default): `reqwest`-based request/response transport
//! - `websocket` (default): `tokio-tungstenite` connector for the signaling channel

#![forbid(unsafe_code)]

pub mod channel;
pub mod protocol;
pub mod signaling;
pub mod socket;
pub mod traits;

#[cfg(feature = "http")]
pub mod http;

mod mock;
pub use mock::{MockConnector, MockCoordinator, MockSocketServer};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::channel::*;
    pub use crate::protocol::*;
    pub use crate::signaling::*;
    pub use crate::traits::*;
}

/// Result type for network operations
pub type Result<T> = core::result::Result<T, Error>;

/// Network error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Could not reach the remote end
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// Request could not be completed
    #[error("request failed: {0}")]
    Request(String),
    /// Coordinator answered with a non-success status
    #[error("coordinator returned status {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body, possibly empty
        body: String,
    },
    /// WebSocket protocol failure
    #[error("websocket error: {0}")]
    WebSocket(String),
    /// Channel has not been connected
    #[error("channel is not connected")]
    NotConnected,
    /// Channel closed while waiting
    #[error("channel closed")]
    Closed,
    /// Malformed message or body
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    /// Endpoint URL cannot be used
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidMessage(err.to_string())
    }
}

impl From<Error> for fedlink_core::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::InvalidMessage(cause) => fedlink_core::Error::Decoding(cause),
            Error::InvalidEndpoint(cause) => fedlink_core::Error::Config(cause),
            Error::Status { status, body } => fedlink_core::Error::Network {
                cause: if body.is_empty() {
                    format!("status {status}")
                } else {
                    body
                },
                status: Some(status),
            },
            other => fedlink_core::Error::network(other.to_string()),
        }
    }
}
