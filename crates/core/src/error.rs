//! Error types for Duet avatar sessions
//!
//! One taxonomy is shared by every layer: the relay maps provider HTTP
//! statuses onto it, the relay client maps wire envelopes back onto it, and
//! the negotiator reports it to observers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for Duet operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while negotiating or driving an avatar session
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Missing credentials or persona id; raised before any network call
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Relay request missing a required field
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Provider rejected the credentials (401)
    #[error("Provider authentication failed: {0}")]
    ProviderAuth(String),

    /// Provider does not know the avatar or session (404)
    #[error("Provider resource not found: {0}")]
    ProviderNotFound(String),

    /// Provider rate limit hit (429); never retried automatically
    #[error("Provider rate limit exceeded: {0}")]
    ProviderRateLimited(String),

    /// Provider 5xx, unexpected status, non-success code or malformed body
    #[error("Provider upstream error{}: {detail}", .status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default())]
    ProviderUpstream {
        /// HTTP status returned by the provider, if any
        status: Option<u16>,
        /// Raw detail from the provider response
        detail: String,
    },

    /// Relay call exceeded its time cap
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Local SDP or ICE construction failure
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// Peer connection reached "failed" after the session was started
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// HTTP transport failure reaching the relay or provider
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Wire classification of an [`Error`], used in relay envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing or malformed request field
    BadRequest,
    /// Provider rejected credentials
    Unauthorized,
    /// Unknown avatar or session
    NotFound,
    /// Provider rate limit
    RateLimited,
    /// Anything else the provider (or the path to it) got wrong
    UpstreamError,
    /// Call exceeded its time cap
    Timeout,
}

impl ErrorKind {
    /// HTTP status code the relay answers with for this kind
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::BadRequest => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::NotFound => 404,
            ErrorKind::RateLimited => 429,
            ErrorKind::UpstreamError => 502,
            ErrorKind::Timeout => 504,
        }
    }
}

impl Error {
    /// Build the error matching a provider HTTP status
    ///
    /// Only called for non-success statuses.
    pub fn from_provider_status(status: u16, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match status {
            401 | 403 => Error::ProviderAuth(detail),
            404 => Error::ProviderNotFound(detail),
            429 => Error::ProviderRateLimited(detail),
            _ => Error::ProviderUpstream {
                status: Some(status),
                detail,
            },
        }
    }

    /// Rebuild an error from a relay envelope
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::BadRequest => Error::InvalidRequest(message),
            ErrorKind::Unauthorized => Error::ProviderAuth(message),
            ErrorKind::NotFound => Error::ProviderNotFound(message),
            ErrorKind::RateLimited => Error::ProviderRateLimited(message),
            ErrorKind::Timeout => Error::Timeout(message),
            ErrorKind::UpstreamError => Error::ProviderUpstream {
                status: None,
                detail: message,
            },
        }
    }

    /// Wire classification for relay responses
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) | Error::InvalidRequest(_) => ErrorKind::BadRequest,
            Error::ProviderAuth(_) => ErrorKind::Unauthorized,
            Error::ProviderNotFound(_) => ErrorKind::NotFound,
            Error::ProviderRateLimited(_) => ErrorKind::RateLimited,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::ProviderUpstream { .. }
            | Error::Negotiation(_)
            | Error::ConnectionFailed(_)
            | Error::Transport(_) => ErrorKind::UpstreamError,
        }
    }

    /// Check if this error ends the negotiation of the role that hit it
    ///
    /// Everything is terminal except failures that never reach a negotiator
    /// (bad relay requests are the caller's bug, not the session's).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Error::InvalidRequest(_))
    }

    /// Check if this error came from the provider side of the relay
    pub fn is_provider_error(&self) -> bool {
        matches!(
            self,
            Error::ProviderAuth(_)
                | Error::ProviderNotFound(_)
                | Error::ProviderRateLimited(_)
                | Error::ProviderUpstream { .. }
        )
    }
}
