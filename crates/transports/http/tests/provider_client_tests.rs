//! ProviderClient tests against a local mock of the provider API

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use duet_core::{ApiKey, Error, IceCandidate, Relay, SessionToken};
use duet_relay::ProviderClient;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// What the mock provider saw and how it should answer
#[derive(Default)]
struct MockProvider {
    requests: Mutex<Vec<(String, HeaderMap, Value)>>,
    create_token: Mutex<Option<(StatusCode, Value)>>,
    new_session: Mutex<Option<(StatusCode, Value)>>,
    task: Mutex<Option<(StatusCode, Value)>>,
}

type Shared = Arc<MockProvider>;

impl MockProvider {
    fn record(&self, operation: &str, headers: HeaderMap, body: Value) {
        self.requests.lock().push((operation.to_string(), headers, body));
    }

    fn requests(&self) -> Vec<(String, HeaderMap, Value)> {
        self.requests.lock().clone()
    }
}

fn canned(slot: &Mutex<Option<(StatusCode, Value)>>, default: Value) -> (StatusCode, Json<Value>) {
    let (status, body) = slot.lock().clone().unwrap_or((StatusCode::OK, default));
    (status, Json(body))
}

async fn create_token(
    State(mock): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    mock.record("create_token", headers, body);
    canned(&mock.create_token, json!({"error": null, "data": {"token": "tok_123"}}))
}

async fn new_session(
    State(mock): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    mock.record("new", headers, body);
    canned(
        &mock.new_session,
        json!({
            "code": 100,
            "message": "success",
            "data": {
                "session_id": "sess_0123456789abcdefghijklmnop",
                "sdp": {"type": "offer", "sdp": "v=0\r\n"},
                "ice_servers": [{"urls": ["stun:stun.example.com:3478"]}]
            }
        }),
    )
}

async fn ack(
    State(mock): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    mock.record("ack", headers, body);
    (StatusCode::OK, Json(json!({"code": 100, "message": "success"})))
}

async fn task(
    State(mock): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    mock.record("task", headers, body);
    canned(&mock.task, json!({"code": 100, "data": {"duration_ms": 1200}}))
}

async fn list(State(mock): State<Shared>, headers: HeaderMap) -> (StatusCode, Json<Value>) {
    let authorized = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|k| k == "valid-key");
    mock.record("list", headers, Value::Null);
    if authorized {
        (StatusCode::OK, Json(json!({"code": 100, "data": {"sessions": []}})))
    } else {
        (StatusCode::UNAUTHORIZED, Json(json!({"message": "Unauthorized"})))
    }
}

async fn slow() -> StatusCode {
    tokio::time::sleep(Duration::from_secs(5)).await;
    StatusCode::OK
}

async fn spawn_mock(mock: Shared) -> String {
    let router = Router::new()
        .route("/v1/streaming.create_token", post(create_token))
        .route("/v1/streaming.new", post(new_session))
        .route("/v1/streaming.ice", post(ack))
        .route("/v1/streaming.start", post(ack))
        .route("/v1/streaming.stop", post(ack))
        .route("/v1/streaming.task", post(task))
        .route("/v1/streaming.list", get(list))
        .with_state(mock);
    serve(router).await
}

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

fn client(base_url: &str) -> ProviderClient {
    ProviderClient::new(
        base_url,
        Some(ApiKey::new("account-key")),
        Duration::from_secs(5),
    )
    .unwrap()
}

#[tokio::test]
async fn test_issue_token_uses_api_key_and_trims_avatar() {
    let mock = Arc::new(MockProvider::default());
    let base = spawn_mock(mock.clone()).await;

    let token = client(&base).issue_token("  p1 ").await.unwrap();
    assert_eq!(token.as_str(), "tok_123");

    let requests = mock.requests();
    let (op, headers, body) = &requests[0];
    assert_eq!(op, "create_token");
    assert_eq!(headers["x-api-key"], "account-key");
    assert_eq!(body, &json!({"avatar_id": "p1"}));
}

#[tokio::test]
async fn test_issue_token_status_mapping() {
    for (status, check) in [
        (StatusCode::UNAUTHORIZED, "auth"),
        (StatusCode::NOT_FOUND, "not_found"),
        (StatusCode::TOO_MANY_REQUESTS, "rate"),
        (StatusCode::INTERNAL_SERVER_ERROR, "upstream"),
    ] {
        let mock = Arc::new(MockProvider::default());
        *mock.create_token.lock() = Some((status, json!({"message": "nope"})));
        let base = spawn_mock(mock.clone()).await;

        let err = client(&base).issue_token("p1").await.unwrap_err();
        match check {
            "auth" => assert!(matches!(err, Error::ProviderAuth(ref m) if m == "nope")),
            "not_found" => assert!(matches!(err, Error::ProviderNotFound(_))),
            "rate" => assert!(matches!(err, Error::ProviderRateLimited(_))),
            _ => assert!(matches!(err, Error::ProviderUpstream { status: Some(500), .. })),
        }
    }
}

#[tokio::test]
async fn test_issue_token_without_key_fails_before_calling() {
    let mock = Arc::new(MockProvider::default());
    let base = spawn_mock(mock.clone()).await;

    let client = ProviderClient::new(&base, None, Duration::from_secs(5)).unwrap();
    let err = client.issue_token("p1").await.unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
    assert!(mock.requests().is_empty());
}

#[tokio::test]
async fn test_issue_token_missing_token_is_upstream_error() {
    let mock = Arc::new(MockProvider::default());
    *mock.create_token.lock() = Some((StatusCode::OK, json!({"data": {}})));
    let base = spawn_mock(mock.clone()).await;

    let err = client(&base).issue_token("p1").await.unwrap_err();
    assert!(matches!(err, Error::ProviderUpstream { .. }));
}

#[tokio::test]
async fn test_create_session() {
    let mock = Arc::new(MockProvider::default());
    let base = spawn_mock(mock.clone()).await;

    let handle = client(&base)
        .with_idle_timeout(120)
        .create_session(&SessionToken::new("tok_123"))
        .await
        .unwrap();

    assert_eq!(handle.session_id, "sess_0123456789abcdefghijklmnop");
    assert_eq!(handle.sdp_offer.sdp, "v=0\r\n");
    assert_eq!(handle.ice_servers.len(), 1);

    let requests = mock.requests();
    let (_, headers, body) = &requests[0];
    assert_eq!(headers["authorization"], "Bearer tok_123");
    assert_eq!(body, &json!({"activity_idle_timeout": 120}));
}

#[tokio::test]
async fn test_create_session_missing_data() {
    let mock = Arc::new(MockProvider::default());
    *mock.new_session.lock() = Some((
        StatusCode::OK,
        json!({"code": 100, "data": {"session_id": "s1", "sdp": {"type": "offer", "sdp": "v=0"}}}),
    ));
    let base = spawn_mock(mock.clone()).await;

    let err = client(&base)
        .create_session(&SessionToken::new("tok_123"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ProviderUpstream { ref detail, .. } if detail == "missing session data"));
}

#[tokio::test]
async fn test_non_success_code_is_upstream_error() {
    let mock = Arc::new(MockProvider::default());
    *mock.new_session.lock() = Some((
        StatusCode::OK,
        json!({"code": 10013, "message": "concurrency limit reached"}),
    ));
    let base = spawn_mock(mock.clone()).await;

    let err = client(&base)
        .create_session(&SessionToken::new("tok_123"))
        .await
        .unwrap_err();
    match err {
        Error::ProviderUpstream { status, detail } => {
            assert_eq!(status, None);
            assert!(detail.contains("concurrency limit reached"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_start_ice_stop_wire_bodies() {
    let mock = Arc::new(MockProvider::default());
    let base = spawn_mock(mock.clone()).await;
    let client = client(&base);
    let token = SessionToken::new("tok_123");

    let candidate = IceCandidate {
        candidate: "candidate:1 1 udp 1 10.0.0.2 5000 typ host".to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    };
    client.submit_ice_candidate(&token, "s1", &candidate).await.unwrap();
    client.start_session(&token, "s1", "v=0\r\n").await.unwrap();
    client.stop_session(&token, "s1").await.unwrap();

    let bodies: Vec<Value> = mock.requests().into_iter().map(|(_, _, b)| b).collect();
    assert_eq!(bodies[0]["session_id"], "s1");
    assert_eq!(bodies[0]["candidate"]["sdpMLineIndex"], 0);
    assert_eq!(
        bodies[1],
        json!({"session_id": "s1", "sdp": {"type": "answer", "sdp": "v=0\r\n"}})
    );
    assert_eq!(bodies[2], json!({"session_id": "s1"}));
}

#[tokio::test]
async fn test_speech_acceptance_follows_code() {
    let mock = Arc::new(MockProvider::default());
    let base = spawn_mock(mock.clone()).await;
    let token = SessionToken::new("tok_123");

    let ack = client(&base).send_speech(&token, "s1", "Hello").await.unwrap();
    assert!(ack.accepted);
    assert_eq!(
        mock.requests()[0].2,
        json!({"session_id": "s1", "text": "Hello", "task_type": "talk"})
    );

    *mock.task.lock() = Some((StatusCode::OK, json!({"code": 400, "message": "busy"})));
    let ack = client(&base).send_speech(&token, "s1", "Hello").await.unwrap();
    assert!(!ack.accepted);
}

#[tokio::test]
async fn test_credentials() {
    let mock = Arc::new(MockProvider::default());
    let base = spawn_mock(mock.clone()).await;
    let client = client(&base);

    let check = client.test_credentials(&ApiKey::new("valid-key")).await.unwrap();
    assert!(check.valid);

    let check = client.test_credentials(&ApiKey::new("abc")).await.unwrap();
    assert!(!check.valid);
}

#[tokio::test]
async fn test_timeout_is_reported() {
    let base = serve(Router::new().route("/v1/streaming.stop", post(slow))).await;
    let client =
        ProviderClient::new(&base, Some(ApiKey::new("k")), Duration::from_millis(200)).unwrap();

    let err = client
        .stop_session(&SessionToken::new("t"), "s1")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
}
