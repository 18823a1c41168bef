//! Relay transport error types

use thiserror::Error;

/// Errors raised while setting up or running the relay transport
///
/// Per-request failures travel as [`duet_core::Error`]; this type covers
/// client construction and the server lifecycle.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid base URL or HTTP client construction failure
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Bind or serve failure
    #[error("Server error: {0}")]
    ServerError(String),
}

/// Result type for relay transport setup operations
pub type Result<T> = std::result::Result<T, Error>;

/// Map a reqwest failure onto the shared taxonomy
pub(crate) fn request_error(context: &str, e: reqwest::Error) -> duet_core::Error {
    if e.is_timeout() {
        duet_core::Error::Timeout(format!("{} timed out", context))
    } else {
        duet_core::Error::Transport(format!("{}: {}", context, e))
    }
}

pub(crate) fn validate_base_url(base_url: &str) -> Result<()> {
    if base_url.is_empty() {
        return Err(Error::ConnectionError("base_url cannot be empty".to_string()));
    }
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return Err(Error::ConnectionError(format!(
            "base_url must start with http:// or https://, got: {}",
            base_url
        )));
    }
    Ok(())
}
