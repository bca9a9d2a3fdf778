//! End-to-end tests: the full axum router in front of wiremock backends.

use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, Response, StatusCode, header},
};
use bytes::Bytes;
use chrono::Utc;
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    sync::{mpsc, oneshot},
};
use tokio_stream::wrappers::ReceiverStream;
use tower::ServiceExt;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{any, body_json as body_json_eq, header as header_eq, method, path, query_param},
};

use crate::{
    accounts::{AccountDirectory, InMemoryAccountDirectory, tests::directory},
    app::{AppState, build_router},
    config::{
        ApiKeyConfig, GatewayConfig, IdentityConfig, LogFormat, ProxyConfig, RateLimitBackendConfig,
        RateLimitConfig, RouteConfig, UsageConfig, UsageSinkConfig, WebhookConfig,
    },
    gateway::Gateway,
    identity::{
        ADMIN_ROLE, IdentityVerifier, Plan,
        tests::{SECRET, sign},
    },
    ratelimit::{CounterStore, in_memory::InMemoryCounterStore},
    router::RouteTable,
    usage::{UsageEvent, UsageOutcome, UsageRecorder, tests::MemorySink},
    webhooks::StripeSignatureVerifier,
};

const WEBHOOK_SECRET: &str = "whsec_test";
const ADMIN_KEY: &str = "svc-key-1";

fn route(prefix: &str, product: &str, backend_url: &str, plans: Option<Vec<Plan>>) -> RouteConfig {
    RouteConfig {
        path_prefix: prefix.to_string(),
        product: product.to_string(),
        backend_url: backend_url.to_string(),
        plans,
        forward_credentials: false,
    }
}

pub(crate) fn test_config(backend_url: &str) -> GatewayConfig {
    GatewayConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        service_name: "API Gateway".to_string(),
        log_format: LogFormat::Compact,
        identity: IdentityConfig {
            jwt_secret: Some(SECRET.to_string()),
            token_ttl_secs: 600,
            api_keys: vec![ApiKeyConfig {
                key: ADMIN_KEY.to_string(),
                subject: "svc-billing".to_string(),
                plan: Plan::Enterprise,
                roles: vec![ADMIN_ROLE.to_string()],
            }],
            ..IdentityConfig::default()
        },
        rate_limit: RateLimitConfig {
            backend: RateLimitBackendConfig::InMemory,
            // wide window so a test never straddles a boundary
            window_seconds: 3_600,
            plan_limits: [(Plan::Free, 1_000), (Plan::Pro, 10_000), (Plan::Enterprise, 100_000)]
                .into_iter()
                .collect(),
            fail_open_on_error: false,
        },
        proxy: ProxyConfig {
            timeout_ms: 2_000,
            connect_timeout_ms: 500,
            service_token: None,
        },
        routes: vec![
            route("/api/vllm", "vllm", backend_url, None),
            route("/api/storage", "minio", backend_url, None),
            route(
                "/api/premium",
                "premium",
                backend_url,
                Some(vec![Plan::Pro, Plan::Enterprise]),
            ),
        ],
        usage: UsageConfig {
            queue_capacity: 4_096,
            max_attempts: 3,
            sink: UsageSinkConfig::Log,
        },
        webhook: WebhookConfig {
            stripe_secret: Some(WEBHOOK_SECRET.to_string()),
            tolerance_secs: 300,
        },
        cors_allowed_origins: Vec::new(),
        bootstrap_admin: None,
    }
}

fn usage_pipeline(config: &GatewayConfig) -> (UsageRecorder, Arc<MemorySink>) {
    let (recorder, drain) = UsageRecorder::new(config.usage.queue_capacity);
    let sink = Arc::new(MemorySink::default());
    drain.spawn(sink.clone(), config.usage.max_attempts);
    (recorder, sink)
}

pub(crate) fn test_gateway(
    config: &GatewayConfig,
    store: Arc<dyn CounterStore>,
) -> (Gateway, Arc<MemorySink>) {
    let (recorder, sink) = usage_pipeline(config);
    let gateway = Gateway::from_config(
        config,
        Arc::new(IdentityVerifier::from_config(&config.identity).unwrap()),
        store,
        Arc::new(RouteTable::new(config.routes.clone())),
        recorder,
    )
    .unwrap();
    (gateway, sink)
}

struct TestApp {
    router: Router,
    sink: Arc<MemorySink>,
    directory: Arc<InMemoryAccountDirectory>,
}

impl TestApp {
    fn new(config: GatewayConfig) -> Self {
        let (recorder, sink) = usage_pipeline(&config);
        let usage_stats = recorder.stats();
        let verifier = Arc::new(IdentityVerifier::from_config(&config.identity).unwrap());
        let routes = Arc::new(RouteTable::new(config.routes.clone()));
        let gateway = Gateway::from_config(
            &config,
            verifier.clone(),
            Arc::new(InMemoryCounterStore::new()),
            routes.clone(),
            recorder,
        )
        .unwrap();
        let directory = Arc::new(directory());

        let state = AppState {
            service_name: config.service_name.clone(),
            gateway: Arc::new(gateway),
            verifier,
            routes,
            directory: directory.clone(),
            usage_stats,
            billing_webhook: config
                .webhook
                .stripe_secret
                .as_deref()
                .map(|s| Arc::new(StripeSignatureVerifier::new(s, config.webhook.tolerance_secs))),
        };

        Self {
            router: build_router(state, &config.cors_allowed_origins),
            sink,
            directory,
        }
    }

    fn for_backend(backend_url: &str) -> Self {
        Self::new(test_config(backend_url))
    }

    async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// Waits for the drain task to hand `n` events to the sink.
    async fn usage_events(&self, n: usize) -> Vec<UsageEvent> {
        for _ in 0..200 {
            let events = self.sink.events();
            if events.len() >= n {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.sink.events()
    }
}

fn token(subject: &str, plan: &str, expires_in: i64) -> String {
    sign(
        json!({ "sub": subject, "plan": plan, "exp": Utc::now().timestamp() + expires_in }),
        SECRET,
    )
}

fn get(uri: &str, bearer: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {bearer}"))
        .body(Body::empty())
        .unwrap()
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
}

async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

async fn backend_ok() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn status_endpoint_reports_operational() {
    let app = TestApp::for_backend("http://127.0.0.1:1");
    let response = app
        .send(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "operational");
    assert_eq!(body["service"], "API Gateway");
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn expired_token_is_rejected_without_backend_call() {
    let server = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    let app = TestApp::for_backend(&server.uri());

    let response = app.send(get("/api/vllm/generate", &token("u1", "pro", -3_600))).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"], "invalid_credential");

    let response = app
        .send(Request::builder().uri("/api/vllm/generate").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Bearer");
    assert_eq!(body_json(response).await["error"], "unauthenticated");
}

#[tokio::test]
async fn thousandth_request_passes_and_next_is_limited() {
    let server = backend_ok().await;
    let app = TestApp::for_backend(&server.uri());
    let bearer = token("free-user", "free", 600);

    for i in 1..=1_000 {
        let response = app.send(get("/api/vllm/generate", &bearer)).await;
        assert_eq!(response.status(), StatusCode::OK, "request {i}");
        if i == 1_000 {
            assert_eq!(response.headers()["x-ratelimit-limit"], "1000");
            assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
        }
    }

    let response = app.send(get("/api/vllm/generate", &bearer)).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response.headers()[header::RETRY_AFTER]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=3_600).contains(&retry_after));

    assert_eq!(server.received_requests().await.unwrap().len(), 1_000);
    let events = app.usage_events(1_000).await;
    assert_eq!(events.len(), 1_000);
    assert!(events.iter().all(|e| e.subject_id == "free-user" && e.product == "vllm"));
}

#[tokio::test]
async fn unknown_plan_claim_gets_most_restrictive_limit() {
    let server = backend_ok().await;
    let app = TestApp::for_backend(&server.uri());

    let response = app.send(get("/api/vllm/x", &token("u1", "platinum", 600))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-ratelimit-limit"], "1000");
}

#[tokio::test]
async fn unmapped_route_never_reaches_a_backend() {
    let server = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    let app = TestApp::for_backend(&server.uri());

    let response = app.send(get("/api/unknown/thing", &token("u1", "pro", 600))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["error"], "route_not_found");

    let response = app
        .send(Request::builder().uri("/nowhere").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(app.sink.events().is_empty());
}

#[tokio::test]
async fn plan_gated_route_rejects_without_usage() {
    let server = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    let app = TestApp::for_backend(&server.uri());

    let response = app.send(get("/api/premium/models", &token("u1", "free", 600))).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await["error"], "forbidden");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(app.sink.events().is_empty());
}

#[tokio::test]
async fn request_and_response_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/generate"))
        .and(query_param("stream", "false"))
        .and(header_eq("x-custom", "abc"))
        .and(header_eq("x-gateway-subject", "user-7"))
        .and(header_eq("x-gateway-plan", "pro"))
        .and(header_eq("x-gateway-product", "vllm"))
        .and(body_json_eq(json!({ "prompt": "hello" })))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("x-backend", "vllm-1")
                .set_body_json(json!({ "text": "hi there" })),
        )
        .expect(1)
        .mount(&server)
        .await;
    let app = TestApp::for_backend(&server.uri());

    let request = Request::builder()
        .method("POST")
        .uri("/api/vllm/v1/generate?stream=false")
        .header(header::AUTHORIZATION, format!("Bearer {}", token("user-7", "pro", 600)))
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-custom", "abc")
        .header("x-gateway-subject", "spoofed-admin")
        .header("x-request-id", "trace-42")
        .body(Body::from(json!({ "prompt": "hello" }).to_string()))
        .unwrap();
    let response = app.send(request).await;

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.headers()["x-backend"], "vllm-1");
    assert_eq!(response.headers()["x-request-id"], "trace-42");
    assert_eq!(response.headers()["x-ratelimit-limit"], "10000");
    assert_eq!(body_json(response).await, json!({ "text": "hi there" }));

    let received = server.received_requests().await.unwrap();
    assert!(received[0].headers.get("authorization").is_none());
    assert_eq!(received[0].headers.get("x-request-id").unwrap(), "trace-42");

    let events = app.usage_events(1).await;
    assert_eq!(events[0].endpoint, "/v1/generate");
    assert_eq!(events[0].method, "POST");
    assert_eq!(events[0].status, Some(201));
    assert_eq!(events[0].outcome, UsageOutcome::Success);
}

#[tokio::test]
async fn backend_errors_pass_through_verbatim() {
    let server = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(500).set_body_string("model crashed"))
        .mount(&server)
        .await;
    let app = TestApp::for_backend(&server.uri());

    let response = app.send(get("/api/storage/bucket/key", &token("u1", "pro", 600))).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_bytes(response).await, b"model crashed");

    let events = app.usage_events(1).await;
    assert_eq!(events[0].product, "minio");
    assert_eq!(events[0].outcome, UsageOutcome::Error);
    assert_eq!(events[0].status, Some(500));
}

#[tokio::test]
async fn unreachable_backend_is_bad_gateway() {
    // nothing listens on port 1
    let app = TestApp::for_backend("http://127.0.0.1:1");

    let response = app.send(get("/api/vllm/x", &token("u1", "pro", 600))).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(body_json(response).await["error"], "backend_unavailable");

    let events = app.usage_events(1).await;
    assert_eq!(events[0].status, None);
    assert_eq!(events[0].outcome, UsageOutcome::Error);
}

#[tokio::test]
async fn slow_backend_times_out() {
    let server = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;
    let mut config = test_config(&server.uri());
    config.proxy.timeout_ms = 200;
    let app = TestApp::new(config);

    let response = app.send(get("/api/vllm/x", &token("u1", "pro", 600))).await;
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body_json(response).await["error"], "backend_timeout");
}

/// A backend that sends response headers and one chunk of a chunked body,
/// then holds the connection. The receiver fires once the gateway hangs up.
async fn holding_backend() -> (String, oneshot::Receiver<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (closed_tx, closed_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 8192];
        let mut head = Vec::new();
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            head.extend_from_slice(&buf[..n]);
        }

        socket
            .write_all(
                b"HTTP/1.1 200 OK\r\n\
                  content-type: text/event-stream\r\n\
                  transfer-encoding: chunked\r\n\r\n\
                  6\r\nfirst\n\r\n",
            )
            .await
            .unwrap();
        socket.flush().await.unwrap();

        while let Ok(n) = socket.read(&mut buf).await {
            if n == 0 {
                break;
            }
        }
        let _ = closed_tx.send(());
    });

    (format!("http://{addr}"), closed_rx)
}

#[tokio::test]
async fn disconnected_caller_is_still_metered() {
    let server = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(800)))
        .mount(&server)
        .await;
    let app = TestApp::for_backend(&server.uri());

    // the caller gives up while the backend is still working
    let gave_up = tokio::time::timeout(
        Duration::from_millis(200),
        app.send(get("/api/vllm/generate", &token("u1", "pro", 600))),
    )
    .await;
    assert!(gave_up.is_err());

    let events = app.usage_events(1).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].subject_id, "u1");
    assert_eq!(events[0].product, "vllm");
    assert_eq!(events[0].outcome, UsageOutcome::Cancelled);
    assert_eq!(events[0].status, None);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn slow_upload_that_keeps_sending_is_not_cut_off() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/bucket/big"))
        .respond_with(ResponseTemplate::new(200).set_body_string("stored"))
        .mount(&server)
        .await;
    let mut config = test_config(&server.uri());
    config.proxy.timeout_ms = 300;
    let app = TestApp::new(config);

    // ten 1 KiB chunks, 60ms apart: longer than the timeout in total
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(1);
    tokio::spawn(async move {
        for _ in 0..10 {
            tx.send(Ok(Bytes::from(vec![b'x'; 1024]))).await.unwrap();
            tokio::time::sleep(Duration::from_millis(60)).await;
        }
    });
    let request = Request::builder()
        .method("PUT")
        .uri("/api/storage/bucket/big")
        .header(header::AUTHORIZATION, format!("Bearer {}", token("u1", "pro", 600)))
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap();

    let response = app.send(request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"stored");

    let received = server.received_requests().await.unwrap();
    assert_eq!(received[0].body.len(), 10 * 1024);
}

#[tokio::test]
async fn chunked_response_reaches_caller_before_backend_finishes() {
    let (backend_url, _closed) = holding_backend().await;
    let app = TestApp::for_backend(&backend_url);

    let response = app.send(get("/api/vllm/stream", &token("u1", "pro", 600))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");

    let mut body = response.into_body().into_data_stream();
    let first = tokio::time::timeout(Duration::from_secs(1), body.next())
        .await
        .expect("first chunk should arrive while the backend is still open")
        .unwrap()
        .unwrap();
    assert_eq!(first, Bytes::from_static(b"first\n"));
}

#[tokio::test]
async fn stalled_response_body_is_cut_off() {
    let (backend_url, closed) = holding_backend().await;
    let mut config = test_config(&backend_url);
    config.proxy.timeout_ms = 300;
    let app = TestApp::new(config);

    let response = app.send(get("/api/vllm/stream", &token("u1", "pro", 600))).await;
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body().into_data_stream();
    assert!(body.next().await.unwrap().is_ok());
    let stalled = tokio::time::timeout(Duration::from_secs(2), body.next())
        .await
        .expect("stalled body should fail within the idle timeout");
    assert!(matches!(stalled, Some(Err(_))));

    drop(body);
    tokio::time::timeout(Duration::from_secs(2), closed)
        .await
        .expect("backend connection should be closed")
        .unwrap();
}

#[tokio::test]
async fn caller_disconnect_closes_backend_connection() {
    let (backend_url, closed) = holding_backend().await;
    let mut config = test_config(&backend_url);
    config.proxy.timeout_ms = 30_000;
    let app = TestApp::new(config);

    let response = app.send(get("/api/vllm/stream", &token("u1", "pro", 600))).await;
    let mut body = response.into_body().into_data_stream();
    assert!(body.next().await.unwrap().is_ok());

    // caller goes away mid-stream, long before any idle timeout
    drop(body);
    tokio::time::timeout(Duration::from_secs(2), closed)
        .await
        .expect("backend connection should be closed")
        .unwrap();
}

#[tokio::test]
async fn register_login_and_call_a_product() {
    let server = MockServer::start().await;
    Mock::given(header_eq("x-gateway-plan", "pro"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    let app = TestApp::for_backend(&server.uri());
    let credentials = json!({ "email": "ada@example.com", "password": "correct-horse", "plan": "pro" });

    let response = app.send(post_json("/auth/register", &credentials)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["user"]["plan"], "pro");

    let response = app.send(post_json("/auth/register", &credentials)).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = app
        .send(post_json(
            "/auth/register",
            &json!({ "email": "b@example.com", "password": "correct-horse", "plan": "gold" }),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .send(
            Request::builder()
                .method("POST")
                .uri("/auth/register")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .send(post_json(
            "/auth/login",
            &json!({ "email": "ada@example.com", "password": "wrong-horse" }),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app.send(post_json("/auth/login", &credentials)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let products = body["products"].as_array().unwrap();
    assert!(products.contains(&json!("premium")));
    let issued = body["token"].as_str().unwrap().to_string();

    let response = app.send(get("/api/premium/models", &issued)).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn admin_endpoints_require_admin_role() {
    let app = TestApp::for_backend("http://127.0.0.1:1");
    app.directory
        .register("a@example.com", "password1", Plan::Free)
        .await
        .unwrap();

    let response = app
        .send(Request::builder().uri("/admin/users").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app.send(get("/admin/users", &token("u1", "enterprise", 600))).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let admin = |uri: &str| {
        Request::builder()
            .uri(uri)
            .header("x-api-key", ADMIN_KEY)
            .body(Body::empty())
            .unwrap()
    };

    let response = app.send(admin("/admin/users")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["users"][0]["email"], "a@example.com");

    let response = app.send(admin("/admin/analytics")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["total_users"], 1);
    assert_eq!(body["plans"]["free"], 1);
    assert!(body["usage"]["products"].is_object());
}

#[tokio::test]
async fn signed_subscription_webhook_updates_plan() {
    let app = TestApp::for_backend("http://127.0.0.1:1");
    app.directory
        .register("ada@example.com", "password1", Plan::Free)
        .await
        .unwrap();

    let payload = json!({
        "id": "evt_1",
        "type": "customer.subscription.updated",
        "data": { "object": { "metadata": { "email": "ada@example.com", "plan": "pro" } } }
    })
    .to_string();
    let signer = StripeSignatureVerifier::new(WEBHOOK_SECRET, 300);
    let webhook = |signature: String| {
        Request::builder()
            .method("POST")
            .uri("/webhooks/stripe")
            .header("stripe-signature", signature)
            .body(Body::from(payload.clone()))
            .unwrap()
    };

    let forged = StripeSignatureVerifier::new("whsec_other", 300)
        .sign(payload.as_bytes(), Utc::now().timestamp());
    let response = app.send(webhook(forged)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(app.directory.list(1).await.unwrap()[0].plan, Plan::Free);

    let signature = signer.sign(payload.as_bytes(), Utc::now().timestamp());
    let response = app.send(webhook(signature)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({ "received": true }));
    assert_eq!(app.directory.list(1).await.unwrap()[0].plan, Plan::Pro);
}
