//! Data model shared by the relay and the negotiators

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// STUN server used when the provider hands back no ICE servers
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

const REDACTED_PREFIX_LEN: usize = 8;
const SHORT_ID_LEN: usize = 20;

/// Persona a session renders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Patient,
    Doctor,
}

impl Role {
    /// Both roles, in startup order
    pub const ALL: [Role; 2] = [Role::Patient, Role::Doctor];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Patient => "patient",
            Role::Doctor => "doctor",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keep the first few characters of a secret for log correlation
pub fn redact_secret(secret: &str) -> String {
    let prefix: String = secret.chars().take(REDACTED_PREFIX_LEN).collect();
    format!("{}...", prefix)
}

/// Truncate a provider session id for log output
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(SHORT_ID_LEN) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// Provider API key
///
/// `Debug` and `Display` never print the full key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The raw key, for attaching to outbound provider requests
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiKey({})", redact_secret(&self.0))
    }
}

impl fmt::Display for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&redact_secret(&self.0))
    }
}

/// Credentials for one patient/doctor session group
///
/// Immutable once built; the orchestrator hands the same value to both
/// negotiators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCredentials {
    pub api_key: ApiKey,
    pub patient_avatar_id: String,
    pub doctor_avatar_id: String,
}

impl ProviderCredentials {
    pub fn new(
        api_key: ApiKey,
        patient_avatar_id: impl Into<String>,
        doctor_avatar_id: impl Into<String>,
    ) -> Self {
        Self {
            api_key,
            patient_avatar_id: patient_avatar_id.into(),
            doctor_avatar_id: doctor_avatar_id.into(),
        }
    }

    /// Avatar id rendered for `role`
    pub fn avatar_for(&self, role: Role) -> &str {
        match role {
            Role::Patient => &self.patient_avatar_id,
            Role::Doctor => &self.doctor_avatar_id,
        }
    }

    /// Check that `role` can negotiate with these credentials
    pub fn validate_for(&self, role: Role) -> Result<()> {
        if self.api_key.is_blank() {
            return Err(Error::Configuration("provider API key is missing".to_string()));
        }
        if self.avatar_for(role).trim().is_empty() {
            return Err(Error::Configuration(format!("{} avatar id is missing", role)));
        }
        Ok(())
    }
}

/// Short-lived provider token scoping one avatar session
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionToken({})", redact_secret(&self.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// SDP in the browser `RTCSessionDescriptionInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// `urls` field of an ICE server; the provider sends either form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IceUrls {
    One(String),
    Many(Vec<String>),
}

impl IceUrls {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            IceUrls::One(url) => vec![url.clone()],
            IceUrls::Many(urls) => urls.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: IceUrls,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: IceUrls::One(url.into()),
            username: None,
            credential: None,
        }
    }
}

/// Provider-side session created for one role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSessionHandle {
    pub session_id: String,
    pub sdp_offer: SessionDescription,
    pub ice_servers: Vec<IceServer>,
}

impl RemoteSessionHandle {
    /// ICE servers to configure the local peer with, falling back to public STUN
    pub fn effective_ice_servers(&self) -> Vec<IceServer> {
        if self.ice_servers.is_empty() {
            vec![IceServer::stun(DEFAULT_STUN_SERVER)]
        } else {
            self.ice_servers.clone()
        }
    }
}

/// Locally discovered ICE candidate in `RTCIceCandidateInit` JSON shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Provider verdict on a speak command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeechAck {
    pub accepted: bool,
}

/// Result of checking an API key against the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialCheck {
    pub valid: bool,
    pub detail: String,
}
