//! Core types for Duet avatar sessions
//!
//! Duet drives two streaming-avatar sessions (a patient persona and a doctor
//! persona) from token issuance to a connected peer connection. This crate
//! holds what every layer agrees on:
//!
//! - **Data model**: roles, credentials, session handles, ICE candidates
//! - **Error taxonomy**: one [`Error`] enum shared by relay and negotiators
//! - **Relay contract**: the [`Relay`] trait, implemented by the provider
//!   client, the HTTP relay client and test fakes
//! - **Wire envelope**: the `{success, data|error}` shape of relay responses
//! - **Configuration**: TOML/environment loading for the binaries
//!
//! # Example
//!
//! ```
//! use duet_core::{ApiKey, ProviderCredentials, Role};
//!
//! let credentials = ProviderCredentials::new(ApiKey::new("abc"), "p1", "d1");
//! assert_eq!(credentials.avatar_for(Role::Doctor), "d1");
//! assert!(credentials.validate_for(Role::Patient).is_ok());
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod envelope;
pub mod error;
pub mod relay;
pub mod types;

pub use config::{Config, ConfigError, StartupPolicy};
pub use envelope::{Ack, Envelope, ErrorBody};
pub use error::{Error, ErrorKind, Result};
pub use relay::Relay;
pub use types::{
    redact_secret, short_id, ApiKey, CredentialCheck, IceCandidate, IceServer, IceUrls,
    ProviderCredentials, RemoteSessionHandle, Role, SdpType, SessionDescription, SessionToken,
    SpeechAck, DEFAULT_STUN_SERVER,
};

/// Version of the Duet core crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
