//! Coordinator session payloads
//!
//! These are the JSON bodies exchanged with the coordinator, either as HTTP
//! request/response bodies or as the `data` field of a signaling message.

use std::time::Duration;

use fedlink_core::config::ClientConfig;
use fedlink_core::identity::{ArtifactId, RequestKey, WorkerId};
use serde::{Deserialize, Deserializer, Serialize};

/// Authentication request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthRequest {
    /// Bearer token, when the coordinator requires one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Model the worker wants to train
    #[serde(rename = "model")]
    pub model_name: String,
    /// Model version
    #[serde(rename = "version")]
    pub model_version: String,
}

/// Successful authentication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthResponse {
    /// Identity assigned to this worker
    pub worker_id: WorkerId,
    /// Whether the cycle request must carry connection metrics
    #[serde(default)]
    pub requires_speed_test: bool,
}

/// Error body returned by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable cause
    pub error: String,
}

/// Authentication outcome; success is tried first when decoding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AuthReply {
    /// Worker id issued
    Accepted(AuthResponse),
    /// Coordinator refused
    Denied(ErrorBody),
}

/// Cycle admission request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRequest {
    /// Authenticated worker
    pub worker_id: WorkerId,
    /// Model name
    pub model: String,
    /// Model version
    pub version: String,
    /// Ping in milliseconds, null when not probed
    pub ping: Option<f64>,
    /// Download speed in MB/s, null when not probed
    pub download: Option<f64>,
    /// Upload speed in MB/s, null when not probed
    pub upload: Option<f64>,
}

/// Cycle accepted by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleAccepted {
    /// Always `accepted`
    pub status: String,
    /// Key identifying this cycle
    pub request_key: RequestKey,
    /// Plan to download
    pub training_plan: ArtifactId,
    /// Training hyperparameters
    pub client_config: ClientConfig,
    /// Protocol to run, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<ArtifactId>,
    /// Model to download
    pub model: ArtifactId,
}

/// Cycle declined by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRejected {
    /// Status string, usually `rejected`
    pub status: String,
    /// Seconds to wait before asking again
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    /// Optional cause
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CycleRejected {
    /// Retry hint as a duration
    pub fn retry_after(&self) -> Option<Duration> {
        self.timeout
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(Duration::from_secs_f64)
    }
}

/// Cycle admission outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CycleResponse {
    /// Admitted
    Accepted(CycleAccepted),
    /// Declined
    Rejected(CycleRejected),
}

impl<'de> Deserialize<'de> for CycleResponse {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        let accepted = value.get("status").and_then(|s| s.as_str()) == Some("accepted");
        if accepted {
            return CycleAccepted::deserialize(value)
                .map(CycleResponse::Accepted)
                .map_err(serde::de::Error::custom);
        }
        CycleRejected::deserialize(value)
            .map(CycleResponse::Rejected)
            .map_err(serde::de::Error::custom)
    }
}

/// Kind of downloadable artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    /// Training plan
    Plan,
    /// Model parameters
    Model,
}

impl ArtifactKind {
    /// Download path below the API prefix
    pub fn path(&self) -> &'static str {
        match self {
            ArtifactKind::Plan => "get-plan",
            ArtifactKind::Model => "get-model",
        }
    }

    /// Query key naming the artifact id
    pub fn id_param(&self) -> &'static str {
        match self {
            ArtifactKind::Plan => "plan_id",
            ArtifactKind::Model => "model_id",
        }
    }
}

/// Parameters of a single artifact download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRequest {
    /// What to download
    pub kind: ArtifactKind,
    /// Authenticated worker
    pub worker_id: WorkerId,
    /// Current cycle
    pub request_key: RequestKey,
    /// Plan or model id
    pub artifact_id: ArtifactId,
}

impl ArtifactRequest {
    /// Query parameters for the download URL
    pub fn query(&self) -> Vec<(&'static str, String)> {
        vec![
            ("worker_id", self.worker_id.to_string()),
            ("request_key", self.request_key.to_string()),
            (self.kind.id_param(), self.artifact_id.to_string()),
        ]
    }
}

/// Diff report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRequest {
    /// Authenticated worker
    pub worker_id: WorkerId,
    /// Current cycle
    pub request_key: RequestKey,
    /// Base64 of the encoded diff container
    pub diff: String,
}

/// Report acknowledgement
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReportReply {
    /// Status string, usually `success`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Cause, when the report was refused
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn auth_reply_tries_success_first() {
        let ok: AuthReply =
            serde_json::from_value(json!({"worker_id": "w-1", "requires_speed_test": true})).unwrap();
        assert_eq!(
            ok,
            AuthReply::Accepted(AuthResponse {
                worker_id: WorkerId::new("w-1"),
                requires_speed_test: true,
            })
        );
        let denied: AuthReply = serde_json::from_value(json!({"error": "invalid token"})).unwrap();
        assert!(matches!(denied, AuthReply::Denied(ErrorBody { ref error }) if error == "invalid token"));
    }

    #[test]
    fn auth_request_omits_missing_token() {
        let request = AuthRequest {
            auth_token: None,
            model_name: "mnist".into(),
            model_version: "1.0.0".into(),
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"model": "mnist", "version": "1.0.0"})
        );
    }

    #[test]
    fn cycle_request_sends_null_metrics() {
        let request = CycleRequest {
            worker_id: WorkerId::new("w-1"),
            model: "mnist".into(),
            version: "1.0.0".into(),
            ping: None,
            download: None,
            upload: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert!(value["ping"].is_null());
        assert!(value["upload"].is_null());
    }

    #[test]
    fn cycle_response_decodes_acceptance() {
        let raw = json!({
            "status": "accepted",
            "request_key": "key-1",
            "training_plan": 3,
            "model": 1,
            "protocol": "7",
            "client_config": {"name": "mnist", "version": "1.0.0", "batch_size": 64, "lr": 0.01, "max_updates": 100}
        });
        let response: CycleResponse = serde_json::from_value(raw).unwrap();
        let CycleResponse::Accepted(accepted) = response else {
            panic!("expected acceptance");
        };
        assert_eq!(accepted.training_plan, ArtifactId::new("3"));
        assert_eq!(accepted.model, ArtifactId::new("1"));
        assert_eq!(accepted.client_config.batch_size, 64);
    }

    #[test]
    fn cycle_response_decodes_rejection_with_hint() {
        let response: CycleResponse =
            serde_json::from_value(json!({"status": "rejected", "timeout": 2700})).unwrap();
        let CycleResponse::Rejected(rejected) = response else {
            panic!("expected rejection");
        };
        assert_eq!(rejected.retry_after(), Some(Duration::from_secs(2700)));
    }

    #[test]
    fn incomplete_acceptance_is_a_decoding_error() {
        let result: Result<CycleResponse, _> =
            serde_json::from_value(json!({"status": "accepted", "request_key": "k"}));
        assert!(result.is_err());
        let missing_status: Result<CycleResponse, _> = serde_json::from_value(json!({"timeout": 5}));
        assert!(missing_status.is_err());
    }

    #[test]
    fn artifact_query_names_the_id_by_kind() {
        let request = ArtifactRequest {
            kind: ArtifactKind::Plan,
            worker_id: WorkerId::new("w"),
            request_key: RequestKey::new("k"),
            artifact_id: ArtifactId::new("5"),
        };
        assert_eq!(
            request.query(),
            vec![
                ("worker_id", "w".to_string()),
                ("request_key", "k".to_string()),
                ("plan_id", "5".to_string()),
            ]
        );
    }
}
