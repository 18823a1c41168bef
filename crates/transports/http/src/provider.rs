//! Streaming-avatar provider API client
//!
//! Direct [`Relay`] implementation against the provider's `/v1/streaming.*`
//! endpoints. Holds the account API key; only the relay server should ever
//! construct one.

use crate::error::{request_error, validate_base_url, Error, Result};
use async_trait::async_trait;
use duet_core::config::ProviderConfig;
use duet_core::{
    short_id, ApiKey, CredentialCheck, IceCandidate, IceServer, Relay, RemoteSessionHandle,
    SessionDescription, SessionToken, SpeechAck,
};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Response `code` the provider uses for success
const PROVIDER_SUCCESS_CODE: i64 = 100;

/// Client for the provider's streaming API
pub struct ProviderClient {
    /// Base URL (e.g., "https://api.heygen.com")
    base_url: String,

    /// Account key for token issuance
    api_key: Option<ApiKey>,

    /// `activity_idle_timeout` sent with new sessions
    idle_timeout_seconds: u64,

    /// Reqwest HTTP client
    client: reqwest::Client,
}

enum Auth<'a> {
    ApiKey(&'a ApiKey),
    Bearer(&'a SessionToken),
}

/// `data` of a `streaming.new` response
#[derive(Debug, Deserialize)]
struct NewSessionData {
    session_id: Option<String>,
    sdp: Option<SessionDescription>,
    ice_servers: Option<Vec<IceServer>>,
}

impl ProviderClient {
    /// Create a new provider client
    ///
    /// # Arguments
    ///
    /// * `base_url` - Provider API base URL
    /// * `api_key` - Account key; token issuance fails without one
    /// * `timeout` - Per-request timeout
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<ApiKey>,
        timeout: Duration,
    ) -> Result<Self> {
        let base_url = base_url.into();
        validate_base_url(&base_url)?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::ConnectionError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            idle_timeout_seconds: 300,
            client,
        })
    }

    /// Create a provider client from the `[provider]` configuration section
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        Ok(Self::new(
            config.base_url.clone(),
            config.api_key.clone(),
            config.request_timeout(),
        )?
        .with_idle_timeout(config.idle_timeout_seconds))
    }

    pub fn with_idle_timeout(mut self, seconds: u64) -> Self {
        self.idle_timeout_seconds = seconds;
        self
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.as_ref().is_some_and(|k| !k.is_blank())
    }

    fn endpoint(&self, operation: &str) -> String {
        format!("{}/v1/{}", self.base_url, operation)
    }

    fn account_key(&self) -> duet_core::Result<&ApiKey> {
        self.api_key
            .as_ref()
            .filter(|k| !k.is_blank())
            .ok_or_else(|| {
                duet_core::Error::Configuration("provider API key is not configured".to_string())
            })
    }

    /// Perform one provider call and return the parsed JSON body
    ///
    /// Non-success statuses are mapped through
    /// [`duet_core::Error::from_provider_status`]; an empty success body
    /// yields `Value::Null`.
    async fn call(
        &self,
        method: Method,
        operation: &'static str,
        auth: Auth<'_>,
        body: Option<Value>,
    ) -> duet_core::Result<Value> {
        let mut request = self.client.request(method, self.endpoint(operation));
        request = match auth {
            Auth::ApiKey(key) => request.header("X-Api-Key", key.expose()),
            Auth::Bearer(token) => request.bearer_auth(token.as_str()),
        };
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| request_error(operation, e))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| request_error(operation, e))?;

        if !status.is_success() {
            warn!(
                operation,
                status = status.as_u16(),
                "Provider call failed"
            );
            return Err(duet_core::Error::from_provider_status(
                status.as_u16(),
                provider_message(&text),
            ));
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_str(&text).map_err(|e| duet_core::Error::ProviderUpstream {
            status: Some(status.as_u16()),
            detail: format!("{} returned malformed JSON: {}", operation, e),
        })
    }
}

/// Best human-readable message from a provider error body
fn provider_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        let candidates = [
            value.get("message"),
            value.pointer("/error/message"),
            value.get("error"),
        ];
        for candidate in candidates.into_iter().flatten() {
            if let Some(message) = candidate.as_str().filter(|m| !m.is_empty()) {
                return message.to_string();
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "no detail".to_string()
    } else {
        trimmed.to_string()
    }
}

fn response_code(body: &Value) -> Option<i64> {
    body.get("code").and_then(Value::as_i64)
}

/// Reject bodies carrying a provider `code` other than success
fn ensure_success_code(operation: &str, body: &Value) -> duet_core::Result<()> {
    match response_code(body) {
        Some(code) if code != PROVIDER_SUCCESS_CODE => Err(duet_core::Error::ProviderUpstream {
            status: None,
            detail: format!(
                "{} returned code {}: {}",
                operation,
                code,
                provider_message(&body.to_string())
            ),
        }),
        _ => Ok(()),
    }
}

#[async_trait]
impl Relay for ProviderClient {
    async fn issue_token(&self, avatar_id: &str) -> duet_core::Result<SessionToken> {
        let avatar_id = avatar_id.trim();
        if avatar_id.is_empty() {
            return Err(duet_core::Error::InvalidRequest("avatarId is required".to_string()));
        }
        let key = self.account_key()?;

        debug!(avatar_id, api_key = %key, "Creating session token");
        let body = self
            .call(
                Method::POST,
                "streaming.create_token",
                Auth::ApiKey(key),
                Some(json!({ "avatar_id": avatar_id })),
            )
            .await?;
        ensure_success_code("streaming.create_token", &body)?;

        let token = body
            .pointer("/data/token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| duet_core::Error::ProviderUpstream {
                status: None,
                detail: "no token received".to_string(),
            })?;

        info!(avatar_id, "Issued session token");
        Ok(SessionToken::new(token))
    }

    async fn create_session(&self, token: &SessionToken) -> duet_core::Result<RemoteSessionHandle> {
        let body = self
            .call(
                Method::POST,
                "streaming.new",
                Auth::Bearer(token),
                Some(json!({ "activity_idle_timeout": self.idle_timeout_seconds })),
            )
            .await?;
        ensure_success_code("streaming.new", &body)?;

        let missing = || duet_core::Error::ProviderUpstream {
            status: None,
            detail: "missing session data".to_string(),
        };
        let data = body.get("data").cloned().ok_or_else(missing)?;
        let data: NewSessionData =
            serde_json::from_value(data).map_err(|e| duet_core::Error::ProviderUpstream {
                status: None,
                detail: format!("malformed session data: {}", e),
            })?;

        match (data.session_id, data.sdp, data.ice_servers) {
            (Some(session_id), Some(sdp_offer), Some(ice_servers)) if !session_id.is_empty() => {
                info!(
                    session_id = short_id(&session_id),
                    ice_servers = ice_servers.len(),
                    "Created provider session"
                );
                Ok(RemoteSessionHandle {
                    session_id,
                    sdp_offer,
                    ice_servers,
                })
            }
            _ => Err(missing()),
        }
    }

    async fn submit_ice_candidate(
        &self,
        token: &SessionToken,
        session_id: &str,
        candidate: &IceCandidate,
    ) -> duet_core::Result<()> {
        let body = self
            .call(
                Method::POST,
                "streaming.ice",
                Auth::Bearer(token),
                Some(json!({ "session_id": session_id, "candidate": candidate })),
            )
            .await?;
        ensure_success_code("streaming.ice", &body)
    }

    async fn start_session(
        &self,
        token: &SessionToken,
        session_id: &str,
        sdp_answer: &str,
    ) -> duet_core::Result<()> {
        let body = self
            .call(
                Method::POST,
                "streaming.start",
                Auth::Bearer(token),
                Some(json!({
                    "session_id": session_id,
                    "sdp": SessionDescription::answer(sdp_answer),
                })),
            )
            .await?;
        ensure_success_code("streaming.start", &body)?;

        info!(session_id = short_id(session_id), "Started provider session");
        Ok(())
    }

    async fn send_speech(
        &self,
        token: &SessionToken,
        session_id: &str,
        text: &str,
    ) -> duet_core::Result<SpeechAck> {
        let body = self
            .call(
                Method::POST,
                "streaming.task",
                Auth::Bearer(token),
                Some(json!({
                    "session_id": session_id,
                    "text": text,
                    "task_type": "talk",
                })),
            )
            .await?;

        // The task endpoint reports refusal through `code`, not the HTTP status
        let accepted = response_code(&body) == Some(PROVIDER_SUCCESS_CODE);
        debug!(session_id = short_id(session_id), accepted, "Speech task sent");
        Ok(SpeechAck { accepted })
    }

    async fn stop_session(&self, token: &SessionToken, session_id: &str) -> duet_core::Result<()> {
        self.call(
            Method::POST,
            "streaming.stop",
            Auth::Bearer(token),
            Some(json!({ "session_id": session_id })),
        )
        .await?;

        info!(session_id = short_id(session_id), "Stopped provider session");
        Ok(())
    }

    async fn test_credentials(&self, api_key: &ApiKey) -> duet_core::Result<CredentialCheck> {
        if api_key.is_blank() {
            return Err(duet_core::Error::InvalidRequest("apiKey is required".to_string()));
        }

        debug!(api_key = %api_key, "Testing provider credentials");
        match self
            .call(Method::GET, "streaming.list", Auth::ApiKey(api_key), None)
            .await
        {
            Ok(_) => Ok(CredentialCheck {
                valid: true,
                detail: "API key is valid".to_string(),
            }),
            Err(duet_core::Error::ProviderAuth(_)) => Ok(CredentialCheck {
                valid: false,
                detail: "Authentication failed. Please check your API key.".to_string(),
            }),
            Err(e) => Err(e),
        }
    }
}
