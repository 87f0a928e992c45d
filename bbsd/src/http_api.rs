//! HTTP API.
//!
//! Provides:
//! - `POST /webhook-notify` - webhook ingestion
//! - `GET /health` - basic daemon health check

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{ConnectInfo, Query, State},
    http::{Extensions, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bbs_common::ErrorCode;
use serde_json::json;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::dispatch::Dispatcher;
use crate::signature::SIGNATURE_HEADER;
use crate::webhook::{
    self, Delivery, EVENT_KEY_HEADER, IngestError, NormalizeContext, VARIANT_HEADER,
};

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    pub context: NormalizeContext,
    pub dispatcher: Dispatcher,
    /// Daemon version.
    pub version: &'static str,
    /// Daemon start time.
    pub started_at: Instant,
    /// Daemon PID.
    pub pid: u32,
}

pub fn create_router(state: HttpState) -> Router {
    Router::new()
        .route("/webhook-notify", post(webhook_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::new(state))
}

/// Handler for `/health`.
async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": state.version,
        "pid": state.pid,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "sources": state.context.sources.len(),
        "hook_delay_secs": state.dispatcher.delay().as_secs(),
    }))
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn reject(status: StatusCode, code: ErrorCode, message: String) -> Response {
    (
        status,
        Json(json!({
            "status": "rejected",
            "code": code.code_string(),
            "message": message,
        })),
    )
        .into_response()
}

/// Handler for `/webhook-notify`.
///
/// Validation happens inline; normalization and dispatch run after the
/// response has been produced.
async fn webhook_handler(
    State(state): State<Arc<HttpState>>,
    Query(params): Query<HashMap<String, String>>,
    extensions: Extensions,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let origin = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let delivery = Delivery {
        event_key: header(&headers, EVENT_KEY_HEADER),
        variant_hint: header(&headers, VARIANT_HEADER),
        signature: header(&headers, SIGNATURE_HEADER),
        server_url: params.get("server_url").map(String::as_str),
        origin: &origin,
        body: &body,
    };

    let event = match webhook::authenticate(&state.context.config, &delivery) {
        Ok(event) => event,
        Err(err) => {
            let status = if err.is_forbidden() {
                StatusCode::FORBIDDEN
            } else {
                StatusCode::BAD_REQUEST
            };
            debug!(%status, origin = %origin, "Rejected webhook: {}", err);
            return reject(status, err.code(), err.to_string());
        }
    };

    let delivery_id = Uuid::new_v4();
    let span = info_span!(
        "webhook",
        delivery = %delivery_id,
        event = %event.key,
        variant = %event.variant,
    );
    info!(parent: &span, server_url = %event.server_url, format = %event.format, "Webhook accepted");

    let context = state.context.clone();
    let dispatcher = state.dispatcher.clone();
    tokio::spawn(
        async move {
            let normalized =
                tokio::task::spawn_blocking(move || context.normalize(&event)).await;
            match normalized {
                Ok(Ok(normalized)) => {
                    let scheduled = dispatcher.dispatch(normalized);
                    debug!(scheduled, "Webhook normalized");
                }
                Ok(Err(err)) => warn!(
                    code = %IngestError::from(err).code().code_string(),
                    "Webhook payload rejected during normalization"
                ),
                Err(err) => warn!(
                    code = %ErrorCode::InternalDispatchError.code_string(),
                    "Normalization task failed: {}",
                    err
                ),
            }
        }
        .instrument(span),
    );

    (
        StatusCode::OK,
        Json(json!({
            "status": "accepted",
            "delivery_id": delivery_id.to_string(),
        })),
    )
        .into_response()
}

/// Start the HTTP server on `port`.
pub async fn start_server(
    port: u16,
    state: HttpState,
) -> tokio::task::JoinHandle<Result<(), std::io::Error>> {
    let router = create_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!("Listening for webhooks on port {}", port);

    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::signature::{SignatureAlgorithm, sign};
    use axum::body::Body;
    use axum::http::Request;
    use bbs_common::host::{Repository, RepositorySnapshot};
    use bbs_common::{
        BbsConfig, BranchSource, CLOUD_SERVER_URL, DiscoveryTraits, EndpointConfig, HostVariant,
        RepoRef, SnapshotHost,
    };
    use bbs_common::strategy::{ForkTrust, TrustEveryone, TrustNobody};
    use bbs_common::Head;
    use std::time::Duration;
    use tokio::sync::broadcast;
    use tower::ServiceExt;

    const SECRET: &str = "s3cret";

    fn make_test_state(bus: &EventBus) -> HttpState {
        make_test_state_with_trust(bus, Box::new(TrustNobody))
    }

    fn make_test_state_with_trust(bus: &EventBus, trust: Box<dyn ForkTrust>) -> HttpState {
        let mut cloud = EndpointConfig::new(CLOUD_SERVER_URL, HostVariant::Cloud);
        cloud.signature_verification = true;
        cloud.secret = Some(SECRET.into());
        let config = BbsConfig {
            endpoints: vec![
                cloud,
                EndpointConfig::new("https://scm.example.com", HostVariant::Server),
            ],
            ..BbsConfig::default()
        };
        let host = SnapshotHost::new(HostVariant::Cloud, CLOUD_SERVER_URL).with_repository(
            RepositorySnapshot::new(Repository {
                owner: "acme".into(),
                slug: "widgets".into(),
                private: true,
                clone_links: vec![],
                project_key: None,
                main_branch: Some("main".into()),
                roles: vec![],
            }),
        );
        let source = BranchSource::new(
            CLOUD_SERVER_URL,
            RepoRef::new("acme", "widgets"),
            DiscoveryTraits::default(),
            trust,
        );
        HttpState {
            context: NormalizeContext {
                host: Arc::new(host),
                sources: Arc::new(vec![source]),
                config: Arc::new(config),
            },
            dispatcher: Dispatcher::new(Arc::new(bus.clone()), Duration::ZERO),
            version: "0.1.0-test",
            started_at: Instant::now(),
            pid: 12345,
        }
    }

    fn push_body() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "repository": {"full_name": "acme/widgets"},
            "push": {"changes": [{
                "new": {"type": "branch", "name": "main", "target": {"hash": "a".repeat(40)}},
                "old": {"type": "branch", "name": "main", "target": {"hash": "b".repeat(40)}},
                "created": false,
                "closed": false
            }]}
        }))
        .unwrap()
    }

    fn webhook_request(
        uri: &str,
        key: Option<&str>,
        signature: Option<&str>,
        body: Vec<u8>,
    ) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri(uri);
        if let Some(key) = key {
            builder = builder.header("X-Event-Key", key);
        }
        if let Some(signature) = signature {
            builder = builder.header("X-Hub-Signature", signature);
        }
        builder.body(Body::from(body)).unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    async fn next_event(rx: &mut broadcast::Receiver<String>) -> serde_json::Value {
        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("broadcast recv failed");
        serde_json::from_str(&msg).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let bus = EventBus::new(16);
        let router = create_router(make_test_state(&bus));

        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["version"], "0.1.0-test");
        assert_eq!(json["pid"], 12345);
        assert_eq!(json["sources"], 1);
    }

    #[tokio::test]
    async fn test_signed_push_is_accepted_and_dispatched() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let router = create_router(make_test_state(&bus));
        let body = push_body();
        let signature = sign(SignatureAlgorithm::Sha256, SECRET, &body);

        let response = router
            .oneshot(webhook_request(
                "/webhook-notify",
                Some("repo:push"),
                Some(&signature),
                body,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["status"], "accepted");
        assert!(Uuid::parse_str(json["delivery_id"].as_str().unwrap()).is_ok());

        let event = next_event(&mut rx).await;
        assert_eq!(event["event"], "head_updated");
        assert_eq!(event["data"]["head"]["name"], "main");
        assert_eq!(event["data"]["kind"], "updated");
    }

    fn fork_pull_request_body() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "repository": {"full_name": "acme/widgets"},
            "pullrequest": {
                "id": 10,
                "title": "Patch from a fork",
                "author": {"nickname": "mallory"},
                "source": {
                    "branch": {"name": "patch"},
                    "commit": {"hash": "c".repeat(40)},
                    "repository": {"full_name": "mallory/widgets"}
                },
                "destination": {
                    "branch": {"name": "main"},
                    "commit": {"hash": "a".repeat(40)},
                    "repository": {"full_name": "acme/widgets"}
                }
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_fork_pull_request_delivery_updates_source_trust() {
        for (trust, trusted) in [
            (Box::new(TrustEveryone) as Box<dyn ForkTrust>, true),
            (Box::new(TrustNobody) as Box<dyn ForkTrust>, false),
        ] {
            let bus = EventBus::new(16);
            let mut rx = bus.subscribe();
            let state = make_test_state_with_trust(&bus, trust);
            let sources = Arc::clone(&state.context.sources);
            let router = create_router(state);
            let body = fork_pull_request_body();
            let signature = sign(SignatureAlgorithm::Sha256, SECRET, &body);

            let response = router
                .oneshot(webhook_request(
                    "/webhook-notify",
                    Some("pullrequest:created"),
                    Some(&signature),
                    body,
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);

            let event = next_event(&mut rx).await;
            assert_eq!(event["data"]["kind"], "created");
            let head: Head = serde_json::from_value(event["data"]["head"].clone()).unwrap();
            assert_eq!(head.name(), "PR-10");
            assert_eq!(sources[0].is_trusted(&head), trusted);
        }
    }

    #[tokio::test]
    async fn test_missing_event_key_is_bad_request() {
        let bus = EventBus::new(16);
        let router = create_router(make_test_state(&bus));

        let response = router
            .oneshot(webhook_request("/webhook-notify", None, None, push_body()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = json_body(response).await;
        assert_eq!(json["code"], ErrorCode::WebhookMissingEventKey.code_string());
    }

    #[tokio::test]
    async fn test_tampered_body_is_forbidden() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let router = create_router(make_test_state(&bus));
        let body = push_body();
        let signature = sign(SignatureAlgorithm::Sha256, SECRET, &body);
        let mut tampered = body.clone();
        tampered[0] = b' ';

        let response = router
            .oneshot(webhook_request(
                "/webhook-notify",
                Some("repo:push"),
                Some(&signature),
                tampered,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let json = json_body(response).await;
        assert_eq!(json["code"], ErrorCode::WebhookSignatureMismatch.code_string());
        let nothing = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_bad_signature_encoding_is_bad_request() {
        let bus = EventBus::new(16);
        let router = create_router(make_test_state(&bus));

        let response = router
            .oneshot(webhook_request(
                "/webhook-notify",
                Some("repo:push"),
                Some("sha256=not-hex"),
                push_body(),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_server_is_forbidden() {
        let bus = EventBus::new(16);
        let router = create_router(make_test_state(&bus));

        let response = router
            .oneshot(webhook_request(
                "/webhook-notify?server_url=https%3A%2F%2Fother.example.com",
                Some("repo:refs_changed"),
                None,
                b"{}".to_vec(),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let json = json_body(response).await;
        assert_eq!(json["code"], ErrorCode::WebhookUnknownServer.code_string());
    }

    #[tokio::test]
    async fn test_server_ping_is_acknowledged_without_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let router = create_router(make_test_state(&bus));

        let response = router
            .oneshot(webhook_request(
                "/webhook-notify?server_url=https%3A%2F%2Fscm.example.com",
                Some("diagnostics:ping"),
                None,
                b"{\"test\":true}".to_vec(),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let nothing = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(nothing.is_err());
    }
}
