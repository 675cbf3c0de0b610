//! ProxyError to RFC 9457 problem responses

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use llm_relay_control::ProxyError;
use llm_relay_proto::ErrorCode;
use problem_details::ProblemDetails;
use serde::Serialize;
use std::time::Duration;

/// Extension members carried next to the standard problem fields
#[derive(Debug, Clone, Serialize)]
struct ErrorExtensions {
    code: ErrorCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_ms: Option<u64>,
}

pub fn status_for(error: &ProxyError) -> StatusCode {
    match error {
        ProxyError::AuthenticationFailed(_) => StatusCode::UNAUTHORIZED,
        ProxyError::TunnelUnavailable(_)
        | ProxyError::QueueFull { .. }
        | ProxyError::CircuitOpen { .. }
        | ProxyError::TunnelClosed(_) => StatusCode::SERVICE_UNAVAILABLE,
        ProxyError::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
        ProxyError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        ProxyError::ProtocolError(_) => StatusCode::BAD_GATEWAY,
    }
}

fn title_for(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::AuthenticationFailed => "Authentication Failed",
        ErrorCode::TunnelUnavailable => "Tunnel Unavailable",
        ErrorCode::QueueFull => "Queue Full",
        ErrorCode::RequestTimeout => "Request Timeout",
        ErrorCode::CircuitOpen => "Circuit Open",
        ErrorCode::RateLimitExceeded => "Rate Limit Exceeded",
        ErrorCode::ProtocolError => "Protocol Error",
        ErrorCode::TunnelClosed => "Tunnel Closed",
    }
}

/// Whole seconds for the Retry-After header, never zero
fn retry_after_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs().saturating_add(u64::from(wait.subsec_nanos() > 0));
    secs.max(1)
}

pub fn problem_response(error: &ProxyError) -> Response {
    let status = status_for(error);
    let code = error.code();
    let retry_after = error.retry_after();

    let problem = ProblemDetails::new()
        .with_status(status)
        .with_title(title_for(code))
        .with_detail(error.to_string())
        .with_extensions(ErrorExtensions {
            code,
            retry_after_ms: retry_after.map(|d| d.as_millis() as u64),
        });

    let mut response = (status, Json(problem)).into_response();
    if let Some(wait) = retry_after {
        response.headers_mut().insert(
            header::RETRY_AFTER,
            HeaderValue::from(retry_after_secs(wait)),
        );
    }
    response
}

/// Problem response for errors outside the proxy taxonomy
pub fn plain_problem(status: StatusCode, title: &str, detail: impl Into<String>) -> Response {
    let problem = ProblemDetails::new()
        .with_status(status)
        .with_title(title)
        .with_detail(detail.into());
    (status, Json(problem)).into_response()
}

/// Wrapper so handlers can return `Result<_, ApiError>` and use `?`
#[derive(Debug)]
pub struct ApiError(pub ProxyError);

impl From<ProxyError> for ApiError {
    fn from(e: ProxyError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        problem_response(&self.0)
    }
}
