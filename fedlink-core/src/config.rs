//! Job and client configuration
//!
//! - [`JobConfig`]: what the caller asks for (endpoint, model, version)
//! - [`ClientConfig`]: what the coordinator hands back on cycle acceptance

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// How a job talks to the coordinator, fixed by the endpoint scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Request/response over `http` or `https`
    Http,
    /// Persistent message channel over `ws` or `wss`
    Socket,
}

impl TransportKind {
    /// Select the transport for an endpoint URL
    pub fn from_endpoint(endpoint: &str) -> Result<Self> {
        let scheme = endpoint
            .split_once("://")
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
            .ok_or_else(|| Error::Config(format!("endpoint `{endpoint}` has no scheme")))?;
        match scheme.as_str() {
            "http" | "https" => Ok(TransportKind::Http),
            "ws" | "wss" => Ok(TransportKind::Socket),
            other => Err(Error::Config(format!("unsupported endpoint scheme `{other}`"))),
        }
    }
}

/// Immutable description of one federated-learning job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfig {
    /// Coordinator endpoint, including scheme
    pub endpoint: String,
    /// Model to train
    pub model_name: String,
    /// Model version
    pub version: String,
    /// Optional bearer token for authentication
    pub auth_token: Option<String>,
    /// Transport derived from the endpoint scheme
    pub transport_kind: TransportKind,
}

impl JobConfig {
    /// Start building a job configuration
    pub fn builder(
        endpoint: impl Into<String>,
        model_name: impl Into<String>,
        version: impl Into<String>,
    ) -> JobConfigBuilder {
        JobConfigBuilder {
            endpoint: endpoint.into(),
            model_name: model_name.into(),
            version: version.into(),
            auth_token: None,
        }
    }
}

/// Builder for [`JobConfig`]
#[derive(Debug, Clone)]
pub struct JobConfigBuilder {
    endpoint: String,
    model_name: String,
    version: String,
    auth_token: Option<String>,
}

impl JobConfigBuilder {
    /// Set the authentication token
    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> Result<JobConfig> {
        if self.model_name.is_empty() {
            return Err(Error::Config("model name must not be empty".into()));
        }
        let transport_kind = TransportKind::from_endpoint(&self.endpoint)?;
        Ok(JobConfig {
            endpoint: self.endpoint.trim_end_matches('/').to_string(),
            model_name: self.model_name,
            version: self.version,
            auth_token: self.auth_token,
            transport_kind,
        })
    }
}

/// Training hyperparameters delivered with an accepted cycle.
///
/// Keys the coordinator sends beyond the well-known ones are kept in
/// [`ClientConfig::extra`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Model name as known to the coordinator
    pub name: String,
    /// Model version
    pub version: String,
    /// Samples per training batch
    pub batch_size: u32,
    /// Optimizer learning rate
    #[serde(rename = "lr")]
    pub learning_rate: f64,
    /// Upper bound on local updates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_updates: Option<u32>,
    /// Coordinator-defined extra keys
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}
