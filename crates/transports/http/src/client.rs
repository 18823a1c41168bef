//! HTTP relay client
//!
//! The negotiator-side [`Relay`]: every operation is a POST to a
//! [`crate::RelayServer`] endpoint. The client never holds the provider's
//! account key; `test_credentials` forwards only the key under test.

use crate::error::{request_error, validate_base_url, Error, Result};
use async_trait::async_trait;
use duet_core::{
    Ack, ApiKey, CredentialCheck, Envelope, IceCandidate, Relay, RemoteSessionHandle,
    SessionToken, SpeechAck,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// HTTP client for a Duet relay server
pub struct HttpRelayClient {
    /// Base URL (e.g., "http://localhost:8080")
    base_url: String,

    /// Reqwest HTTP client
    client: reqwest::Client,
}

impl HttpRelayClient {
    /// Create a new relay client
    ///
    /// # Arguments
    ///
    /// * `base_url` - Relay server base URL (e.g., "http://localhost:8080")
    /// * `timeout` - Per-call cap; an expired call surfaces as
    ///   [`duet_core::Error::Timeout`]
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.into();
        validate_base_url(&base_url)?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::ConnectionError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check that the relay is reachable
    pub async fn health_check(&self) -> duet_core::Result<bool> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map_err(|e| request_error("health", e))?;
        Ok(response.status().is_success())
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> duet_core::Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}/api/avatar/{}", self.base_url, path);
        debug!(url = %url, "Calling relay");

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| request_error(path, e))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| request_error(path, e))?;

        match serde_json::from_str::<Envelope<T>>(&text) {
            Ok(envelope) => envelope.into_result(),
            // Not an envelope: a proxy in front of the relay answered
            Err(_) if !status.is_success() => Err(duet_core::Error::from_provider_status(
                status.as_u16(),
                text.trim().to_string(),
            )),
            Err(e) => Err(duet_core::Error::Transport(format!(
                "malformed relay response from {}: {}",
                path, e
            ))),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenBody<'a> {
    avatar_id: &'a str,
}

#[derive(Deserialize)]
struct TokenData {
    token: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionBody<'a> {
    token: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IceBody<'a> {
    token: &'a str,
    session_id: &'a str,
    candidate: &'a IceCandidate,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartBody<'a> {
    token: &'a str,
    session_id: &'a str,
    sdp_answer: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeakBody<'a> {
    token: &'a str,
    session_id: &'a str,
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TestCredentialsBody<'a> {
    api_key: &'a str,
}

#[async_trait]
impl Relay for HttpRelayClient {
    async fn issue_token(&self, avatar_id: &str) -> duet_core::Result<SessionToken> {
        let data: TokenData = self.post("token", &TokenBody { avatar_id }).await?;
        Ok(SessionToken::new(data.token))
    }

    async fn create_session(&self, token: &SessionToken) -> duet_core::Result<RemoteSessionHandle> {
        self.post(
            "session",
            &SessionBody {
                token: token.as_str(),
                session_id: None,
            },
        )
        .await
    }

    async fn submit_ice_candidate(
        &self,
        token: &SessionToken,
        session_id: &str,
        candidate: &IceCandidate,
    ) -> duet_core::Result<()> {
        let _: Ack = self
            .post(
                "ice",
                &IceBody {
                    token: token.as_str(),
                    session_id,
                    candidate,
                },
            )
            .await?;
        Ok(())
    }

    async fn start_session(
        &self,
        token: &SessionToken,
        session_id: &str,
        sdp_answer: &str,
    ) -> duet_core::Result<()> {
        let _: Ack = self
            .post(
                "start",
                &StartBody {
                    token: token.as_str(),
                    session_id,
                    sdp_answer,
                },
            )
            .await?;
        Ok(())
    }

    async fn send_speech(
        &self,
        token: &SessionToken,
        session_id: &str,
        text: &str,
    ) -> duet_core::Result<SpeechAck> {
        self.post(
            "speak",
            &SpeakBody {
                token: token.as_str(),
                session_id,
                text,
            },
        )
        .await
    }

    async fn stop_session(&self, token: &SessionToken, session_id: &str) -> duet_core::Result<()> {
        let _: Ack = self
            .post(
                "stop",
                &SessionBody {
                    token: token.as_str(),
                    session_id: Some(session_id),
                },
            )
            .await?;
        Ok(())
    }

    async fn test_credentials(&self, api_key: &ApiKey) -> duet_core::Result<CredentialCheck> {
        self.post(
            "test-credentials",
            &TestCredentialsBody {
                api_key: api_key.expose(),
            },
        )
        .await
    }
}
