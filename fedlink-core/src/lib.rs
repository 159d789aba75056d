//! # fedlink Core
//!
//! Shared data model for the fedlink client.
//!
//! This crate provides:
//! - Worker, request and peer identifiers
//! - Job and client configuration
//! - The job negotiation state machine
//! - Device capability traits
//! - The error type used across the workspace

#![forbid(unsafe_code)]

pub mod config;
pub mod identity;
pub mod metrics;
pub mod state;
pub mod traits;

use std::time::Duration;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::*;
    pub use crate::identity::*;
    pub use crate::metrics::*;
    pub use crate::state::*;
    pub use crate::traits::*;
    pub use crate::{Error, ErrorKind, Result};
}

/// Result type for fedlink operations
pub type Result<T> = core::result::Result<T, Error>;

/// Device constraint that failed the admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EligibilityConstraint {
    /// Device is not charging
    Charging,
    /// Device is not on Wi-Fi
    Network,
}

impl core::fmt::Display for EligibilityConstraint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            EligibilityConstraint::Charging => write!(f, "device is not charging"),
            EligibilityConstraint::Network => write!(f, "device is not on wifi"),
        }
    }
}

/// Error type for fedlink operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Device does not meet the requested constraints
    #[error("eligibility check failed: {0}")]
    Eligibility(EligibilityConstraint),
    /// Coordinator refused the worker
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// Coordinator declined the cycle
    #[error("cycle rejected with status `{status}`")]
    CycleRejected {
        /// Status string reported by the coordinator
        status: String,
        /// Suggested wait before retrying
        timeout: Option<Duration>,
    },
    /// Transport-level failure
    #[error("network error: {cause}")]
    Network {
        /// Underlying cause
        cause: String,
        /// HTTP status, when one was received
        status: Option<u16>,
    },
    /// Payload could not be decoded
    #[error("decoding error: {0}")]
    Decoding(String),
    /// Original and updated model states differ in structure
    #[error("model structure mismatch: {0}")]
    StructuralMismatch(String),
    /// Signaling referenced a peer with no connection
    #[error("unknown peer `{0}`")]
    UnknownPeer(String),
    /// Peer connection backend failure
    #[error("peer connection error: {0}")]
    Peer(String),
    /// Training executor failure
    #[error("executor error: {0}")]
    Executor(String),
    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Shorthand for a network error without a status code
    pub fn network(cause: impl Into<String>) -> Self {
        Error::Network {
            cause: cause.into(),
            status: None,
        }
    }

    /// The copyable discriminant of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Eligibility(c) => ErrorKind::Eligibility(*c),
            Error::Authentication(_) => ErrorKind::Authentication,
            Error::CycleRejected { .. } => ErrorKind::CycleRejected,
            Error::Network { .. } => ErrorKind::Network,
            Error::Decoding(_) => ErrorKind::Decoding,
            Error::StructuralMismatch(_) => ErrorKind::StructuralMismatch,
            Error::UnknownPeer(_) => ErrorKind::UnknownPeer,
            Error::Peer(_) => ErrorKind::Peer,
            Error::Executor(_) => ErrorKind::Executor,
            Error::Config(_) => ErrorKind::Config,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Decoding(err.to_string())
    }
}

/// Error discriminant, stored in [`state::NegotiationState::Failed`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// See [`Error::Eligibility`]
    Eligibility(EligibilityConstraint),
    /// See [`Error::Authentication`]
    Authentication,
    /// See [`Error::CycleRejected`]
    CycleRejected,
    /// See [`Error::Network`]
    Network,
    /// See [`Error::Decoding`]
    Decoding,
    /// See [`Error::StructuralMismatch`]
    StructuralMismatch,
    /// See [`Error::UnknownPeer`]
    UnknownPeer,
    /// See [`Error::Peer`]
    Peer,
    /// See [`Error::Executor`]
    Executor,
    /// See [`Error::Config`]
    Config,
}
