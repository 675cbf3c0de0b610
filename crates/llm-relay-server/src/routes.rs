//! HTTP surface of the relay

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, DefaultBodyLimit, Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::{sse::Event, IntoResponse, Response, Sse},
    routing::{any, delete, get},
    Json, Router,
};
use futures::stream::Stream;
use llm_relay_auth::Identity;
use llm_relay_control::{Priority, ProxyError, TunnelInfo};
use llm_relay_metrics::TEXT_FORMAT;
use llm_relay_proto::{ProxyRequest, ProxyResponse};
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::problem::{plain_problem, ApiError};
use crate::relay::{ProxyCall, Relay};
use crate::tunnel_ws::handle_tunnel;

pub const PRIORITY_HEADER: &str = "x-relay-priority";
pub const TIMEOUT_HEADER: &str = "x-relay-timeout-ms";

/// Scope that sees and closes every user's tunnels
pub const SCOPE_ADMIN: &str = "admin";

/// Largest proxied request body accepted
pub const PROXY_BODY_LIMIT: usize = 8 * 1024 * 1024;

/// Headers that never travel to the agent
const STRIPPED_HEADERS: &[&str] = &[
    "authorization",
    "host",
    "content-length",
    PRIORITY_HEADER,
    TIMEOUT_HEADER,
];

#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
}

pub fn router(relay: Arc<Relay>) -> Router {
    let state = AppState { relay };

    Router::new()
        .route("/healthz", get(handle_healthz))
        .route("/readyz", get(handle_readyz))
        .route("/metrics", get(handle_metrics))
        .route("/v1/tunnel", get(handle_tunnel))
        .route("/v1/tunnels", get(handle_list_tunnels))
        .route("/v1/tunnels/events", get(handle_tunnel_events))
        .route("/v1/tunnels/{tunnel_id}", delete(handle_close_tunnel))
        .route(
            "/v1/users/{user_id}/proxy/{*path}",
            any(handle_proxy).layer(DefaultBodyLimit::max(PROXY_BODY_LIMIT)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Identity, ApiError> {
    let token = bearer_token(headers)
        .ok_or_else(|| ProxyError::AuthenticationFailed("missing bearer token".to_string()))?;
    Ok(state.relay.registry().authenticate(token).await?)
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
}

async fn handle_healthz() -> Json<Health> {
    Json(Health { status: "ok" })
}

async fn handle_readyz(State(state): State<AppState>) -> Response {
    let readiness = state.relay.readiness().await;
    let status = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(readiness)).into_response()
}

async fn handle_metrics(State(state): State<AppState>) -> Response {
    match state.relay.metrics().encode_text() {
        Ok(text) => ([(header::CONTENT_TYPE, TEXT_FORMAT)], text).into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn handle_list_tunnels(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<TunnelInfo>>, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    let mut tunnels = state.relay.registry().snapshot().await;
    if !identity.has_scope(SCOPE_ADMIN) {
        tunnels.retain(|t| t.user_id == identity.user_id);
    }
    Ok(Json(tunnels))
}

async fn handle_close_tunnel(
    State(state): State<AppState>,
    Path(tunnel_id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    let registry = state.relay.registry();

    let conn = registry
        .get(&tunnel_id)
        .await
        .ok_or_else(|| ProxyError::TunnelUnavailable(format!("unknown tunnel {}", tunnel_id)))?;
    if conn.user_id() != identity.user_id && !identity.has_scope(SCOPE_ADMIN) {
        return Err(ProxyError::AuthenticationFailed(
            "tunnel belongs to another user".to_string(),
        )
        .into());
    }

    registry
        .close(&tunnel_id, &format!("closed by {}", identity.user_id))
        .await?;
    info!("Tunnel {} closed by {}", tunnel_id, identity.user_id);
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_tunnel_events(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    let see_all = identity.has_scope(SCOPE_ADMIN);
    let user_id = identity.user_id;
    debug!("Tunnel event stream opened by {}", user_id);

    let stream = BroadcastStream::new(state.relay.registry().subscribe()).filter_map(
        move |result| {
            // Lagged receivers just skip what they missed
            let event = result.ok()?;
            if !see_all && event.user_id != user_id {
                return None;
            }
            let json = serde_json::to_string(&event).ok()?;
            Some(Ok(Event::default().data(json)))
        },
    );

    Ok(Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

/// Who is calling, for ownership and rate limiting
async fn caller_for(
    state: &AppState,
    headers: &HeaderMap,
    peer: SocketAddr,
    user_id: &str,
) -> Result<String, ApiError> {
    if bearer_token(headers).is_none() && state.relay.allow_anonymous() {
        return Ok(peer.ip().to_string());
    }

    let identity = authenticate(state, headers).await?;
    if identity.user_id != user_id {
        return Err(ProxyError::AuthenticationFailed(format!(
            "token subject may not use the tunnel of {}",
            user_id
        ))
        .into());
    }
    Ok(identity.user_id)
}

fn forwarded_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| !STRIPPED_HEADERS.contains(&name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn into_http(response: ProxyResponse) -> Result<Response, ProxyError> {
    let status = StatusCode::from_u16(response.status).map_err(|_| {
        ProxyError::ProtocolError(format!("agent returned invalid status {}", response.status))
    })?;

    let mut http = Response::new(Body::from(response.body));
    *http.status_mut() = status;
    for (name, value) in response.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                http.headers_mut().append(name, value);
            }
            _ => debug!("Dropping invalid response header '{}'", name),
        }
    }
    Ok(http)
}

async fn handle_proxy(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path((user_id, path)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let priority = match headers.get(PRIORITY_HEADER).map(|v| v.to_str()) {
        None => Priority::default(),
        Some(Ok(value)) => match value.parse::<Priority>() {
            Ok(priority) => priority,
            Err(e) => return Ok(plain_problem(StatusCode::BAD_REQUEST, "Invalid Priority", e)),
        },
        Some(Err(_)) => {
            return Ok(plain_problem(
                StatusCode::BAD_REQUEST,
                "Invalid Priority",
                "priority header is not valid text",
            ))
        }
    };

    let timeout = match headers.get(TIMEOUT_HEADER) {
        None => None,
        Some(value) => match value.to_str().ok().and_then(|v| v.trim().parse::<u64>().ok()) {
            Some(ms) if ms > 0 => Some(Duration::from_millis(ms)),
            _ => {
                return Ok(plain_problem(
                    StatusCode::BAD_REQUEST,
                    "Invalid Timeout",
                    format!("{} must be a positive integer", TIMEOUT_HEADER),
                ))
            }
        },
    };

    let caller = caller_for(&state, &headers, peer, &user_id).await?;

    let mut target = format!("/{}", path);
    if let Some(query) = uri.query() {
        target.push('?');
        target.push_str(query);
    }

    let call = ProxyCall {
        caller,
        user_id,
        request: ProxyRequest {
            method: method.to_string(),
            path: target,
            headers: forwarded_headers(&headers),
            body: body.to_vec(),
        },
        priority,
        timeout,
    };

    let response = state.relay.proxy(call).await?;
    Ok(into_http(response)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn test_forwarded_headers_strip_credentials_and_relay_hints() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        headers.insert(header::HOST, HeaderValue::from_static("relay.example.com"));
        headers.insert(PRIORITY_HEADER, HeaderValue::from_static("high"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let forwarded = forwarded_headers(&headers);

        assert_eq!(
            forwarded,
            vec![("content-type".to_string(), "application/json".to_string())]
        );
    }

    #[test]
    fn test_into_http_rejects_invalid_status() {
        let result = into_http(ProxyResponse::new(1000, "nope"));
        assert!(matches!(result, Err(ProxyError::ProtocolError(_))));
    }

    #[test]
    fn test_into_http_copies_headers() {
        let response = into_http(
            ProxyResponse::new(201, "made").with_header("x-model", "llama3"),
        )
        .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-model"], "llama3");
    }
}
