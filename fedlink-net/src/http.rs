//! Request/response transport over HTTP
//!
//! All calls live below `<endpoint>/<api_prefix>/`:
//!
//! | call          | method | path            |
//! |---------------|--------|-----------------|
//! | authenticate  | POST   | `authenticate`  |
//! | cycle request | POST   | `cycle-request` |
//! | plan          | GET    | `get-plan`      |
//! | model         | GET    | `get-model`     |
//! | speed test    | GET/POST | `speed-test`  |
//! | report        | POST   | `report`        |

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fedlink_core::config::TransportKind;
use fedlink_core::identity::WorkerId;
use rand_core::{OsRng, RngCore};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::protocol::{
    ArtifactRequest, AuthReply, AuthRequest, CycleRequest, CycleResponse, ReportReply, ReportRequest,
};
use crate::traits::{ArtifactSource, CoordinatorTransport, SpeedTest};
use crate::{Error, Result};

/// Default path segment between the endpoint and each call
pub const DEFAULT_API_PREFIX: &str = "model-centric";

/// Default size of the upload probe payload
pub const DEFAULT_UPLOAD_PROBE_BYTES: usize = 64_000_000;

const DOWNLOAD_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const UPLOAD_PROBE_TIMEOUT: Duration = Duration::from_secs(60);
const UPLOAD_PROBE_FILE_NAME: &str = "fedlink_speedtest";
const CACHE_BUSTER_LEN: usize = 30;

/// Rewrite a socket endpoint to its HTTP counterpart (`ws` to `http`, `wss` to `https`)
pub fn http_counterpart(endpoint: &str) -> Result<String> {
    let (scheme, rest) = endpoint
        .split_once("://")
        .ok_or_else(|| Error::InvalidEndpoint(endpoint.to_string()))?;
    let scheme = match scheme.to_ascii_lowercase().as_str() {
        "http" | "ws" => "http",
        "https" | "wss" => "https",
        other => return Err(Error::InvalidEndpoint(format!("unsupported scheme `{other}`"))),
    };
    Ok(format!("{scheme}://{}", rest.trim_end_matches('/')))
}

/// Random alphanumeric string used to defeat caches on speed-test URLs
fn cache_buster() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    (0..CACHE_BUSTER_LEN)
        .map(|_| CHARSET[OsRng.next_u32() as usize % CHARSET.len()] as char)
        .collect()
}

/// Coordinator transport over HTTP
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base: String,
    api_prefix: String,
    upload_probe_bytes: usize,
}

impl HttpTransport {
    /// Create a transport for `endpoint`; socket schemes are rewritten to HTTP
    pub fn new(endpoint: &str) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::new(),
            base: http_counterpart(endpoint)?,
            api_prefix: DEFAULT_API_PREFIX.to_string(),
            upload_probe_bytes: DEFAULT_UPLOAD_PROBE_BYTES,
        })
    }

    /// Use a preconfigured client (timeouts, proxies, TLS)
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Override the path prefix
    pub fn with_api_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.api_prefix = prefix.into().trim_matches('/').to_string();
        self
    }

    /// Override the upload probe size
    pub fn with_upload_probe_bytes(mut self, bytes: usize) -> Self {
        self.upload_probe_bytes = bytes;
        self
    }

    /// Full URL of a call
    pub fn url(&self, path: &str) -> String {
        if self.api_prefix.is_empty() {
            format!("{}/{}", self.base, path)
        } else {
            format!("{}/{}/{}", self.base, self.api_prefix, path)
        }
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let url = self.url(path);
        tracing::debug!(%url, "POST");
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(request_error)?;
        let bytes = checked_body(response).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn get_bytes(&self, path: &str, query: &[(&str, String)]) -> Result<Bytes> {
        let url = self.url(path);
        tracing::debug!(%url, "GET");
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(request_error)?;
        checked_body(response).await
    }
}

fn request_error(err: reqwest::Error) -> Error {
    if err.is_connect() {
        Error::ConnectionFailed(err.to_string())
    } else {
        Error::Request(err.to_string())
    }
}

async fn checked_body(response: reqwest::Response) -> Result<Bytes> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::Status {
            status: status.as_u16(),
            body,
        });
    }
    response.bytes().await.map_err(request_error)
}

#[async_trait]
impl CoordinatorTransport for HttpTransport {
    async fn authenticate(&self, request: &AuthRequest) -> Result<AuthReply> {
        self.post_json("authenticate", request).await
    }

    async fn cycle_request(&self, request: &CycleRequest) -> Result<CycleResponse> {
        self.post_json("cycle-request", request).await
    }

    async fn report(&self, request: &ReportRequest) -> Result<ReportReply> {
        self.post_json("report", request).await
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }
}

#[async_trait]
impl ArtifactSource for HttpTransport {
    async fn fetch(&self, request: &ArtifactRequest) -> Result<Bytes> {
        self.get_bytes(request.kind.path(), &request.query()).await
    }
}

#[async_trait]
impl SpeedTest for HttpTransport {
    async fn download_probe(&self, worker_id: &WorkerId) -> Result<u64> {
        let response = self
            .client
            .get(self.url("speed-test"))
            .query(&[("random", cache_buster()), ("worker_id", worker_id.to_string())])
            .timeout(DOWNLOAD_PROBE_TIMEOUT)
            .send()
            .await
            .map_err(request_error)?;
        Ok(checked_body(response).await?.len() as u64)
    }

    async fn upload_probe(&self, worker_id: &WorkerId) -> Result<u64> {
        let payload = vec![0u8; self.upload_probe_bytes];
        let part = reqwest::multipart::Part::bytes(payload).file_name(UPLOAD_PROBE_FILE_NAME);
        let form = reqwest::multipart::Form::new().part("file", part);
        let response = self
            .client
            .post(self.url("speed-test"))
            .query(&[("random", cache_buster()), ("worker_id", worker_id.to_string())])
            .multipart(form)
            .timeout(UPLOAD_PROBE_TIMEOUT)
            .send()
            .await
            .map_err(request_error)?;
        checked_body(response).await?;
        Ok(self.upload_probe_bytes as u64)
    }
}
