//! Job negotiation state machine
//!
//! A job run moves strictly forward:
//!
//! ```text
//! Idle -> CheckingEligibility -> Authenticating -> [ProbingMetrics] -> RequestingCycle -> Ready
//!                                                                                      -> Rejected
//! any non-terminal state -> Failed
//! ```

use std::time::Duration;

use crate::config::ClientConfig;
use crate::identity::{ArtifactId, RequestKey};
use crate::ErrorKind;

/// Current phase of a job run
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationState {
    /// Created, not started
    Idle,
    /// Running the admission check
    CheckingEligibility,
    /// Waiting for the coordinator to issue a worker id
    Authenticating,
    /// Measuring ping, upload and download
    ProbingMetrics,
    /// Waiting for cycle admission
    RequestingCycle,
    /// Cycle accepted and artifacts downloaded
    Ready {
        /// Hyperparameters for this cycle
        client_config: ClientConfig,
        /// Plan to execute
        plan_id: ArtifactId,
        /// Model to train
        model_id: ArtifactId,
        /// Key identifying this cycle
        request_key: RequestKey,
    },
    /// Coordinator declined the cycle
    Rejected {
        /// Suggested wait before retrying
        timeout: Option<Duration>,
    },
    /// Negotiation halted on an error
    Failed(ErrorKind),
}

impl NegotiationState {
    /// Position along the happy path, used to enforce forward-only movement
    fn rank(&self) -> u8 {
        match self {
            NegotiationState::Idle => 0,
            NegotiationState::CheckingEligibility => 1,
            NegotiationState::Authenticating => 2,
            NegotiationState::ProbingMetrics => 3,
            NegotiationState::RequestingCycle => 4,
            NegotiationState::Ready { .. }
            | NegotiationState::Rejected { .. }
            | NegotiationState::Failed(_) => 5,
        }
    }

    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        self.rank() == 5
    }

    /// Whether `next` is a legal successor of `self`
    pub fn can_advance_to(&self, next: &NegotiationState) -> bool {
        use NegotiationState::*;
        match (self, next) {
            (s, _) if s.is_terminal() => false,
            (_, Failed(_)) => !matches!(self, Idle),
            (Idle, CheckingEligibility) => true,
            (CheckingEligibility, Authenticating) => true,
            (Authenticating, ProbingMetrics | RequestingCycle) => true,
            (ProbingMetrics, RequestingCycle) => true,
            (RequestingCycle, Ready { .. } | Rejected { .. }) => true,
            _ => false,
        }
    }

    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            NegotiationState::Idle => "idle",
            NegotiationState::CheckingEligibility => "checking_eligibility",
            NegotiationState::Authenticating => "authenticating",
            NegotiationState::ProbingMetrics => "probing_metrics",
            NegotiationState::RequestingCycle => "requesting_cycle",
            NegotiationState::Ready { .. } => "ready",
            NegotiationState::Rejected { .. } => "rejected",
            NegotiationState::Failed(_) => "failed",
        }
    }
}

impl Default for NegotiationState {
    fn default() -> Self {
        Self::Idle
    }
}
