//! Shared fixtures for relay tests

#![allow(dead_code)]

use async_trait::async_trait;
use duet_core::{
    ApiKey, CredentialCheck, Error, IceCandidate, IceServer, Relay, RemoteSessionHandle, Result,
    SessionDescription, SessionToken, SpeechAck,
};
use parking_lot::Mutex;

pub const OFFER_SDP: &str = "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

/// Upstream relay that records every call and answers with canned data
#[derive(Default)]
pub struct FakeUpstream {
    calls: Mutex<Vec<String>>,
    payloads: Mutex<Vec<String>>,
    failure: Mutex<Option<Error>>,
}

impl FakeUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails with `error`
    pub fn failing(error: Error) -> Self {
        let upstream = Self::default();
        *upstream.failure.lock() = Some(error);
        upstream
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// SDP answers and speech texts exactly as they reached the upstream
    pub fn payloads(&self) -> Vec<String> {
        self.payloads.lock().clone()
    }

    fn record(&self, call: String) -> Result<()> {
        self.calls.lock().push(call);
        match self.failure.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Relay for FakeUpstream {
    async fn issue_token(&self, avatar_id: &str) -> Result<SessionToken> {
        self.record(format!("issue_token({})", avatar_id))?;
        Ok(SessionToken::new(format!("token-{}", avatar_id)))
    }

    async fn create_session(&self, token: &SessionToken) -> Result<RemoteSessionHandle> {
        self.record(format!("create_session({})", token.as_str()))?;
        Ok(RemoteSessionHandle {
            session_id: "session-1".to_string(),
            sdp_offer: SessionDescription::offer(OFFER_SDP),
            ice_servers: vec![IceServer::stun("stun:stun.example.com:3478")],
        })
    }

    async fn submit_ice_candidate(
        &self,
        token: &SessionToken,
        session_id: &str,
        candidate: &IceCandidate,
    ) -> Result<()> {
        self.record(format!(
            "submit_ice_candidate({}, {}, {})",
            token.as_str(),
            session_id,
            candidate.candidate
        ))
    }

    async fn start_session(
        &self,
        token: &SessionToken,
        session_id: &str,
        sdp_answer: &str,
    ) -> Result<()> {
        self.payloads.lock().push(sdp_answer.to_string());
        self.record(format!(
            "start_session({}, {}, {} bytes)",
            token.as_str(),
            session_id,
            sdp_answer.len()
        ))
    }

    async fn send_speech(
        &self,
        token: &SessionToken,
        session_id: &str,
        text: &str,
    ) -> Result<SpeechAck> {
        self.payloads.lock().push(text.to_string());
        self.record(format!("send_speech({}, {}, {})", token.as_str(), session_id, text))?;
        Ok(SpeechAck { accepted: true })
    }

    async fn stop_session(&self, token: &SessionToken, session_id: &str) -> Result<()> {
        self.record(format!("stop_session({}, {})", token.as_str(), session_id))
    }

    async fn test_credentials(&self, api_key: &ApiKey) -> Result<CredentialCheck> {
        self.record(format!("test_credentials({})", api_key.expose()))?;
        Ok(CredentialCheck {
            valid: api_key.expose() == "abc",
            detail: "checked".to_string(),
        })
    }
}
