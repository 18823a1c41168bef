//! Relay HTTP server
//!
//! Provides the negotiator-facing endpoints, each a single forward to the
//! upstream [`Relay`]:
//! - POST /api/avatar/token - Issue a session token
//! - POST /api/avatar/session - Create a provider session
//! - POST /api/avatar/ice - Trickle one ICE candidate
//! - POST /api/avatar/start - Submit the SDP answer
//! - POST /api/avatar/speak - Send a speak task
//! - POST /api/avatar/stop - Stop a provider session
//! - POST /api/avatar/test-credentials - Check an API key
//! - GET /health - Health check

use crate::error::{Error, Result};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use duet_core::{
    short_id, Ack, ApiKey, Envelope, IceCandidate, Relay, RemoteSessionHandle, SessionToken,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Relay server state shared across handlers
#[derive(Clone)]
struct RelayState {
    /// Where every request is forwarded
    upstream: Arc<dyn Relay>,
}

/// Stateless HTTP relay in front of the avatar provider
pub struct RelayServer {
    /// Server bind address
    bind_address: String,
    /// Shared server state
    state: RelayState,
}

impl RelayServer {
    /// Create a new relay server
    ///
    /// # Arguments
    ///
    /// * `bind_address` - Address to bind to (e.g., "127.0.0.1:8080")
    /// * `upstream` - Relay every request is forwarded to, normally a
    ///   [`crate::ProviderClient`]
    pub fn new(bind_address: impl Into<String>, upstream: Arc<dyn Relay>) -> Self {
        Self {
            bind_address: bind_address.into(),
            state: RelayState { upstream },
        }
    }

    /// Build the router with all endpoints
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/api/avatar/token", post(token_handler))
            .route("/api/avatar/session", post(session_handler))
            .route("/api/avatar/ice", post(ice_handler))
            .route("/api/avatar/start", post(start_handler))
            .route("/api/avatar/speak", post(speak_handler))
            .route("/api/avatar/stop", post(stop_handler))
            .route("/api/avatar/test-credentials", post(test_credentials_handler))
            .with_state(self.state.clone())
            .layer(
                tower::ServiceBuilder::new()
                    .layer(tower_http::trace::TraceLayer::new_for_http())
                    .layer(tower_http::cors::CorsLayer::permissive()),
            )
    }

    /// Start the relay server
    ///
    /// This method blocks until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Start the relay server, stopping gracefully when `shutdown` resolves
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr: std::net::SocketAddr = self
            .bind_address
            .parse()
            .map_err(|e| Error::ServerError(format!("Invalid bind address: {}", e)))?;

        tracing::info!("Starting relay server on {}", addr);

        let router = self.router();

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::ServerError(format!("Failed to bind: {}", e)))?;

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::ServerError(format!("Server error: {}", e)))?;

        Ok(())
    }
}

/// Turn a relay result into an enveloped response with the matching status
fn respond<T: Serialize>(operation: &str, result: duet_core::Result<T>) -> Response {
    match result {
        Ok(data) => (StatusCode::OK, Json(Envelope::ok(data))).into_response(),
        Err(e) => {
            let status =
                StatusCode::from_u16(e.kind().http_status()).unwrap_or(StatusCode::BAD_GATEWAY);
            if e.is_terminal() {
                warn!(operation, status = status.as_u16(), error = %e, "Relay call failed");
            } else {
                debug!(operation, status = status.as_u16(), error = %e, "Relay request rejected");
            }
            (status, Json(Envelope::<T>::err(&e))).into_response()
        }
    }
}

/// Unwrap a JSON body, mapping extractor rejections onto a 400 envelope
fn parse_body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> duet_core::Result<T> {
    payload
        .map(|Json(body)| body)
        .map_err(|e| duet_core::Error::InvalidRequest(format!("Invalid request body: {}", e.body_text())))
}

/// Missing or blank field → client error before any upstream call.
/// The value is forwarded as sent; SDP bodies keep their trailing CRLF.
fn required<'a>(value: &'a Option<String>, field: &str) -> duet_core::Result<&'a str> {
    value
        .as_deref()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| duet_core::Error::InvalidRequest(format!("{} is required", field)))
}

fn required_token(value: &Option<String>) -> duet_core::Result<SessionToken> {
    required(value, "token").map(SessionToken::new)
}

// Handler implementations

/// Health check endpoint
async fn health_handler() -> StatusCode {
    StatusCode::OK
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenRequest {
    avatar_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct TokenData {
    token: String,
}

/// POST /api/avatar/token
async fn token_handler(
    State(state): State<RelayState>,
    payload: std::result::Result<Json<TokenRequest>, JsonRejection>,
) -> Response {
    let result = async {
        let request = parse_body(payload)?;
        let avatar_id = required(&request.avatar_id, "avatarId")?;
        let token = state.upstream.issue_token(avatar_id).await?;
        Ok::<_, duet_core::Error>(TokenData {
            token: token.as_str().to_string(),
        })
    }
    .await;
    respond("issue_token", result)
}

#[derive(Debug, Deserialize)]
struct SessionRequest {
    token: Option<String>,
}

/// POST /api/avatar/session
async fn session_handler(
    State(state): State<RelayState>,
    payload: std::result::Result<Json<SessionRequest>, JsonRejection>,
) -> Response {
    let result: duet_core::Result<RemoteSessionHandle> = async {
        let request = parse_body(payload)?;
        let token = required_token(&request.token)?;
        state.upstream.create_session(&token).await
    }
    .await;
    respond("create_session", result)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IceRequest {
    token: Option<String>,
    session_id: Option<String>,
    candidate: Option<IceCandidate>,
}

/// POST /api/avatar/ice
async fn ice_handler(
    State(state): State<RelayState>,
    payload: std::result::Result<Json<IceRequest>, JsonRejection>,
) -> Response {
    let result = async {
        let request = parse_body(payload)?;
        let token = required_token(&request.token)?;
        let session_id = required(&request.session_id, "sessionId")?;
        let candidate = request
            .candidate
            .as_ref()
            .ok_or_else(|| duet_core::Error::InvalidRequest("candidate is required".to_string()))?;
        state
            .upstream
            .submit_ice_candidate(&token, session_id, candidate)
            .await?;
        Ok::<_, duet_core::Error>(Ack {})
    }
    .await;
    respond("submit_ice_candidate", result)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest {
    token: Option<String>,
    session_id: Option<String>,
    sdp_answer: Option<String>,
}

/// POST /api/avatar/start
async fn start_handler(
    State(state): State<RelayState>,
    payload: std::result::Result<Json<StartRequest>, JsonRejection>,
) -> Response {
    let result = async {
        let request = parse_body(payload)?;
        let token = required_token(&request.token)?;
        let session_id = required(&request.session_id, "sessionId")?;
        let sdp_answer = required(&request.sdp_answer, "sdpAnswer")?;
        debug!(session_id = short_id(session_id), "Forwarding SDP answer");
        state
            .upstream
            .start_session(&token, session_id, sdp_answer)
            .await?;
        Ok::<_, duet_core::Error>(Ack {})
    }
    .await;
    respond("start_session", result)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpeakRequest {
    token: Option<String>,
    session_id: Option<String>,
    text: Option<String>,
}

/// POST /api/avatar/speak
async fn speak_handler(
    State(state): State<RelayState>,
    payload: std::result::Result<Json<SpeakRequest>, JsonRejection>,
) -> Response {
    let result = async {
        let request = parse_body(payload)?;
        let token = required_token(&request.token)?;
        let session_id = required(&request.session_id, "sessionId")?;
        let text = required(&request.text, "text")?;
        state.upstream.send_speech(&token, session_id, text).await
    }
    .await;
    respond("send_speech", result)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StopRequest {
    token: Option<String>,
    session_id: Option<String>,
}

/// POST /api/avatar/stop
async fn stop_handler(
    State(state): State<RelayState>,
    payload: std::result::Result<Json<StopRequest>, JsonRejection>,
) -> Response {
    let result = async {
        let request = parse_body(payload)?;
        let token = required_token(&request.token)?;
        let session_id = required(&request.session_id, "sessionId")?;
        state.upstream.stop_session(&token, session_id).await?;
        Ok::<_, duet_core::Error>(Ack {})
    }
    .await;
    respond("stop_session", result)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TestCredentialsRequest {
    api_key: Option<String>,
}

/// POST /api/avatar/test-credentials
async fn test_credentials_handler(
    State(state): State<RelayState>,
    payload: std::result::Result<Json<TestCredentialsRequest>, JsonRejection>,
) -> Response {
    let result = async {
        let request = parse_body(payload)?;
        let api_key = ApiKey::new(required(&request.api_key, "apiKey")?);
        state.upstream.test_credentials(&api_key).await
    }
    .await;
    respond("test_credentials", result)
}
