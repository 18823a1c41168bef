//! The credential-isolating relay contract

use crate::error::Result;
use crate::types::{
    ApiKey, CredentialCheck, IceCandidate, RemoteSessionHandle, SessionToken, SpeechAck,
};
use async_trait::async_trait;

/// Operations the negotiating layer may perform against the avatar provider
///
/// Every call is a single stateless forward. Implementations attach the
/// provider credential themselves; callers only ever hold a [`SessionToken`].
#[async_trait]
pub trait Relay: Send + Sync {
    /// Exchange the account credential for a token scoped to `avatar_id`
    async fn issue_token(&self, avatar_id: &str) -> Result<SessionToken>;

    /// Create a provider session and receive its SDP offer and ICE servers
    async fn create_session(&self, token: &SessionToken) -> Result<RemoteSessionHandle>;

    /// Trickle one local ICE candidate to the provider
    async fn submit_ice_candidate(
        &self,
        token: &SessionToken,
        session_id: &str,
        candidate: &IceCandidate,
    ) -> Result<()>;

    /// Hand the provider the local SDP answer and start streaming
    async fn start_session(
        &self,
        token: &SessionToken,
        session_id: &str,
        sdp_answer: &str,
    ) -> Result<()>;

    /// Ask the avatar to speak `text`
    async fn send_speech(
        &self,
        token: &SessionToken,
        session_id: &str,
        text: &str,
    ) -> Result<SpeechAck>;

    /// Tear down the provider session
    async fn stop_session(&self, token: &SessionToken, session_id: &str) -> Result<()>;

    /// Check an API key against the provider
    async fn test_credentials(&self, api_key: &ApiKey) -> Result<CredentialCheck>;
}
