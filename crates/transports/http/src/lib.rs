//! Credential-isolating relay for Duet avatar sessions
//!
//! The provider's account key must never reach the negotiating layer. This
//! crate puts an HTTP relay in between:
//!
//! - [`ProviderClient`] speaks the provider's streaming API and holds the key
//! - [`RelayServer`] exposes the seven relay operations as JSON endpoints
//!   over any upstream [`duet_core::Relay`]
//! - [`HttpRelayClient`] is the negotiator-side [`duet_core::Relay`] that
//!   calls those endpoints
//!
//! # Usage
//!
//! ## Server
//!
//! ```no_run
//! use duet_core::config::ProviderConfig;
//! use duet_relay::{ProviderClient, RelayServer};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = ProviderClient::from_config(&ProviderConfig::default())?;
//! let server = RelayServer::new("127.0.0.1:8080", Arc::new(provider));
//! server.serve().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Client
//!
//! ```no_run
//! use duet_core::Relay;
//! use duet_relay::HttpRelayClient;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let relay = HttpRelayClient::new("http://127.0.0.1:8080", Duration::from_secs(10))?;
//! let token = relay.issue_token("avatar-id").await?;
//! let handle = relay.create_session(&token).await?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod client;
pub mod error;
pub mod provider;
pub mod server;

pub use client::HttpRelayClient;
pub use error::{Error, Result};
pub use provider::ProviderClient;
pub use server::RelayServer;
