//! WebRTC session negotiation for Duet
//!
//! This crate turns provider sessions into connected peer connections and
//! keeps a patient/doctor pair of them in step.
//!
//! # Features
//!
//! - **Per-role negotiation**: token, session, offer/answer and trickle ICE
//!   through any [`duet_core::Relay`]
//! - **Explicit lifecycle**: observable [`ConnectionState`] per role
//! - **Ordered bring-up**: the doctor starts after the patient connects
//!   (configurable through [`duet_core::StartupPolicy`])
//! - **Speech dispatch**: per-role FIFO speak requests, dropped while not
//!   connected
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  Orchestrator                                        │
//! │  ├─ Negotiator (patient) ── PeerLink (webrtc)        │
//! │  ├─ Negotiator (doctor)  ── PeerLink (webrtc)        │
//! │  └─ SpeechDispatcher                                 │
//! │     ↓ Relay calls                                    │
//! │  duet-relay HttpRelayClient → relay server → provider│
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use duet_core::{ApiKey, ProviderCredentials, StartupPolicy};
//! use duet_webrtc::{NegotiatorSettings, Orchestrator, WebRtcPeerFactory};
//! use std::sync::Arc;
//!
//! # async fn example(relay: Arc<dyn duet_core::Relay>) -> duet_webrtc::Result<()> {
//! let (orchestrator, mut events) = Orchestrator::new(
//!     relay,
//!     Arc::new(WebRtcPeerFactory::new()),
//!     NegotiatorSettings::default(),
//!     StartupPolicy::Sequential,
//! );
//!
//! let credentials = ProviderCredentials::new(ApiKey::new("abc"), "p1", "d1");
//! orchestrator.start(&credentials).await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{}: {:?}", event.role, event.kind);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod dispatcher;
pub mod events;
pub mod negotiator;
pub mod orchestrator;
pub mod peer;
pub mod state;

pub use dispatcher::{SpeakOutcome, SpeechDispatcher};
pub use events::{SessionEvent, SessionEventKind};
pub use negotiator::{
    Negotiator, NegotiatorSettings, SessionIdentity, DEFAULT_ICE_GATHERING_TIMEOUT,
    DEFAULT_RELAY_CALL_TIMEOUT,
};
pub use orchestrator::{Orchestrator, OrchestratorPhase, RoleReadiness};
pub use peer::{
    LinkState, PeerEvent, PeerFactory, PeerLink, RemoteMedia, WebRtcPeerFactory, WebRtcPeerLink,
};
pub use state::{ConnectionState, StateMachine};

pub use duet_core::{Error, Result};
