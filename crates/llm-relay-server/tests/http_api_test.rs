//! HTTP surface tests driven through `tower::ServiceExt::oneshot`

use axum::{
    body::Body,
    extract::connect_info::MockConnectInfo,
    http::{header, Request, StatusCode},
    Router,
};
use llm_relay_auth::{Identity, StaticTokenValidator};
use llm_relay_control::TunnelConnection;
use llm_relay_proto::{now_millis, Envelope, EnvelopeKind, ProxyRequest, ProxyResponse};
use llm_relay_server::{router, RelayConfig, Relay};
use llm_relay_transport::{ChannelTransport, TunnelTransport};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;

const PEER: ([u8; 4], u16) = ([10, 0, 0, 7], 40000);

fn scopes(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn relay(config: RelayConfig) -> Arc<Relay> {
    let auth = StaticTokenValidator::new()
        .with_token(
            "alice-token",
            Identity::new("alice").with_scopes(scopes(&["tunnel", "proxy"])),
        )
        .with_token(
            "bob-token",
            Identity::new("bob").with_scopes(scopes(&["tunnel", "proxy"])),
        )
        .with_token(
            "root-token",
            Identity::new("root").with_scopes(scopes(&["admin"])),
        );
    Arc::new(Relay::new(Arc::new(auth), &config).unwrap())
}

fn app(relay: &Arc<Relay>) -> Router {
    router(relay.clone()).layer(MockConnectInfo(SocketAddr::from(PEER)))
}

/// Agent that answers every request with the request it saw, as JSON
fn spawn_mirror_agent(agent: ChannelTransport) {
    tokio::spawn(async move {
        while let Ok(Some(envelope)) = agent.recv().await {
            let reply = match envelope.kind {
                EnvelopeKind::Request => {
                    let request: ProxyRequest =
                        envelope.decode_payload(EnvelopeKind::Request).unwrap();
                    let body = serde_json::to_vec(&request).unwrap();
                    Envelope::response(
                        envelope.id,
                        &ProxyResponse::new(200, body).with_header("x-agent", "mirror"),
                    )
                    .unwrap()
                }
                EnvelopeKind::Ping => Envelope::pong(envelope.id, now_millis()).unwrap(),
                _ => continue,
            };
            if agent.send(reply).await.is_err() {
                break;
            }
        }
    });
}

async fn open_tunnel(relay: &Relay, token: &str) -> Arc<TunnelConnection> {
    let (relay_end, agent_end) = ChannelTransport::pair(64);
    spawn_mirror_agent(agent_end);
    relay
        .registry()
        .establish(token, Arc::new(relay_end))
        .await
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn proxy_request(uri: &str, token: Option<&str>) -> axum::http::request::Builder {
    let builder = Request::builder().method("POST").uri(uri);
    match token {
        Some(token) => builder.header(header::AUTHORIZATION, format!("Bearer {}", token)),
        None => builder,
    }
}

#[tokio::test]
async fn test_healthz_is_ok() {
    let relay = relay(RelayConfig::default());
    let response = app(&relay)
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "ok");
}

#[tokio::test]
async fn test_readyz_reports_registry_and_draining() {
    let relay = relay(RelayConfig::default());
    let _tunnel = open_tunnel(&relay, "alice-token").await;

    let response = app(&relay)
        .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["ready"], true);
    assert_eq!(body["tunnels"], 1);
    assert_eq!(body["open_circuits"], 0);

    relay.shutdown().await;
    let response = app(&relay)
        .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_metrics_are_prometheus_text() {
    let relay = relay(RelayConfig::default());
    let response = app(&relay)
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("# TYPE llm_relay_requests_total counter"));
}

#[tokio::test]
async fn test_proxy_requires_token() {
    let relay = relay(RelayConfig::default());
    let response = app(&relay)
        .oneshot(
            proxy_request("/v1/users/alice/proxy/api/generate", None)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(response).await;
    assert_eq!(body["code"], "AUTHENTICATION_FAILED");
    assert_eq!(body["status"], 401);
}

#[tokio::test]
async fn test_proxy_without_tunnel_is_unavailable() {
    let relay = relay(RelayConfig::default());
    let response = app(&relay)
        .oneshot(
            proxy_request("/v1/users/alice/proxy/api/generate", Some("alice-token"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_body(response).await["code"], "TUNNEL_UNAVAILABLE");
}

#[tokio::test]
async fn test_proxy_to_another_users_tunnel_is_refused() {
    let relay = relay(RelayConfig::default());
    let _tunnel = open_tunnel(&relay, "alice-token").await;

    let response = app(&relay)
        .oneshot(
            proxy_request("/v1/users/alice/proxy/api/generate", Some("bob-token"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_proxy_round_trip_through_tunnel() {
    let relay = relay(RelayConfig::default());
    let _tunnel = open_tunnel(&relay, "alice-token").await;

    let response = app(&relay)
        .oneshot(
            proxy_request(
                "/v1/users/alice/proxy/v1/chat/completions?stream=false",
                Some("alice-token"),
            )
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-relay-priority", "high")
            .header("x-relay-timeout-ms", "5000")
            .body(Body::from(r#"{"model":"llama3"}"#))
            .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-agent"], "mirror");

    let seen = json_body(response).await;
    assert_eq!(seen["method"], "POST");
    assert_eq!(seen["path"], "/v1/chat/completions?stream=false");
    assert_eq!(
        String::from_utf8(
            seen["body"]
                .as_array()
                .unwrap()
                .iter()
                .map(|b| b.as_u64().unwrap() as u8)
                .collect()
        )
        .unwrap(),
        r#"{"model":"llama3"}"#
    );

    let names: Vec<&str> = seen["headers"]
        .as_array()
        .unwrap()
        .iter()
        .map(|pair| pair[0].as_str().unwrap())
        .collect();
    assert!(names.contains(&"content-type"));
    assert!(!names.contains(&"authorization"));
    assert!(!names.contains(&"x-relay-priority"));
    assert!(!names.contains(&"x-relay-timeout-ms"));

    assert_eq!(
        relay
            .metrics()
            .requests(llm_relay_metrics::RequestOutcome::Success),
        1
    );
}

#[tokio::test]
async fn test_anonymous_callers_when_allowed() {
    let mut config = RelayConfig::default();
    config.server.allow_anonymous = true;
    let relay = relay(config);
    let _tunnel = open_tunnel(&relay, "alice-token").await;

    let response = app(&relay)
        .oneshot(
            proxy_request("/v1/users/alice/proxy/api/tags", None)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_anonymous_callers_are_limited_by_ip() {
    let mut config = RelayConfig::default();
    config.server.allow_anonymous = true;
    config.rate_limit.window_limit = 1;
    config.rate_limit.adaptive.enabled = false;
    let relay = relay(config);
    let _tunnel = open_tunnel(&relay, "alice-token").await;

    let first = app(&relay)
        .oneshot(
            proxy_request("/v1/users/alice/proxy/api/tags", None)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app(&relay)
        .oneshot(
            proxy_request("/v1/users/alice/proxy/api/tags", None)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(second.headers().contains_key(header::RETRY_AFTER));
    assert_eq!(relay.limiter().in_flight("10.0.0.7"), 0);
    assert_eq!(json_body(second).await["code"], "RATE_LIMIT_EXCEEDED");
}

#[tokio::test]
async fn test_invalid_relay_headers_are_bad_requests() {
    let relay = relay(RelayConfig::default());

    for (name, value) in [("x-relay-priority", "urgent"), ("x-relay-timeout-ms", "soon")] {
        let response = app(&relay)
            .oneshot(
                proxy_request("/v1/users/alice/proxy/api/tags", Some("alice-token"))
                    .header(name, value)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", name);
    }
}

#[tokio::test]
async fn test_tunnel_listing_is_scoped_to_owner() {
    let relay = relay(RelayConfig::default());
    let alice = open_tunnel(&relay, "alice-token").await;
    let _bob = open_tunnel(&relay, "bob-token").await;

    let list = |token: &'static str| {
        Request::builder()
            .uri("/v1/tunnels")
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap()
    };

    let own = json_body(app(&relay).oneshot(list("alice-token")).await.unwrap()).await;
    let own = own.as_array().unwrap();
    assert_eq!(own.len(), 1);
    assert_eq!(own[0]["tunnel_id"], alice.id());

    let all = json_body(app(&relay).oneshot(list("root-token")).await.unwrap()).await;
    assert_eq!(all.as_array().unwrap().len(), 2);

    let anonymous = app(&relay)
        .oneshot(Request::builder().uri("/v1/tunnels").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_delete_tunnel_checks_ownership() {
    let relay = relay(RelayConfig::default());
    let alice = open_tunnel(&relay, "alice-token").await;
    let uri = format!("/v1/tunnels/{}", alice.id());

    let close = |token: &str| {
        Request::builder()
            .method("DELETE")
            .uri(&uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap()
    };

    let refused = app(&relay).oneshot(close("bob-token")).await.unwrap();
    assert_eq!(refused.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(relay.registry().len().await, 1);

    let closed = app(&relay).oneshot(close("alice-token")).await.unwrap();
    assert_eq!(closed.status(), StatusCode::NO_CONTENT);
    assert!(relay.registry().is_empty().await);

    let again = app(&relay).oneshot(close("alice-token")).await.unwrap();
    assert_eq!(again.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let relay = relay(RelayConfig::default());
    let response = app(&relay)
        .oneshot(Request::builder().uri("/v2/nope").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
