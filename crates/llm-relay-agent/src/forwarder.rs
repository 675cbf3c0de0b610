//! Forwards proxied requests to the local model server

use llm_relay_proto::{ErrorCode, ProxyRequest, ProxyResponse};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Headers that describe one hop and must not be replayed on the next
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "content-length",
    "host",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Errors that can occur while forwarding to the upstream
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("Invalid upstream URL '{0}'")]
    InvalidUpstream(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Upstream unreachable: {0}")]
    Unreachable(String),

    #[error("Upstream did not answer in time")]
    Timeout,

    #[error("Upstream error: {0}")]
    Upstream(String),
}

impl ForwardError {
    /// Code reported back to the relay in the `Error` envelope
    pub fn code(&self) -> ErrorCode {
        match self {
            ForwardError::InvalidUpstream(_) | ForwardError::InvalidRequest(_) => {
                ErrorCode::ProtocolError
            }
            ForwardError::Unreachable(_) | ForwardError::Upstream(_) => {
                ErrorCode::TunnelUnavailable
            }
            ForwardError::Timeout => ErrorCode::RequestTimeout,
        }
    }
}

impl From<reqwest::Error> for ForwardError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ForwardError::Timeout
        } else if e.is_connect() {
            ForwardError::Unreachable(e.to_string())
        } else if e.is_builder() {
            ForwardError::InvalidRequest(e.to_string())
        } else {
            ForwardError::Upstream(e.to_string())
        }
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// HTTP client bound to one upstream base URL
#[derive(Debug, Clone)]
pub struct UpstreamForwarder {
    client: reqwest::Client,
    base: String,
}

impl UpstreamForwarder {
    pub fn new(upstream: &str, timeout: Duration) -> Result<Self, ForwardError> {
        let parsed =
            Url::parse(upstream).map_err(|_| ForwardError::InvalidUpstream(upstream.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ForwardError::InvalidUpstream(upstream.to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ForwardError::InvalidUpstream(e.to_string()))?;

        Ok(Self {
            client,
            base: upstream.trim_end_matches('/').to_string(),
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Full upstream URL for a proxied path
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base, path)
        } else {
            format!("{}/{}", self.base, path)
        }
    }

    /// Replay `request` against the upstream and buffer its response
    pub async fn forward(&self, request: &ProxyRequest) -> Result<ProxyResponse, ForwardError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| ForwardError::InvalidRequest(format!("method '{}'", request.method)))?;
        let url = self.url_for(&request.path);
        debug!("Forwarding {} {}", method, url);

        let mut builder = self.client.request(method, &url);
        for (name, value) in &request.headers {
            if !is_hop_by_hop(name) {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }

        let response = builder.body(request.body.clone()).send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await?.to_vec();

        debug!("Upstream answered {} ({} bytes)", status, body.len());
        Ok(ProxyResponse {
            status,
            headers,
            body,
        })
    }
}
