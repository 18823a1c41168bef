//! Speech dispatch
//!
//! A speak request is forwarded through the relay only when the target
//! role is Connected. Requests are never buffered: a role that is still
//! negotiating, or has failed, answers [`SpeakOutcome::NotConnected`]
//! without touching the network. Each role owns one [`SpeechLane`], so
//! requests for the same role reach the provider in call order while the
//! two roles never wait on each other.

use crate::negotiator::{with_cap, Negotiator};
use duet_core::{Error, Relay, Result, Role, SessionToken};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Result of a speak request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakOutcome {
    /// Provider queued the text for synthesis
    Accepted,
    /// Provider answered but did not take the task
    Declined,
    /// Role was not Connected; nothing was sent
    NotConnected,
}

/// Snapshot of a connected session, taken when a speak request arrives
#[derive(Debug, Clone)]
pub(crate) struct SpeechTarget {
    pub(crate) role: Role,
    pub(crate) token: SessionToken,
    pub(crate) session_id: String,
}

/// FIFO speech channel for a single role
pub(crate) struct SpeechLane {
    relay: Arc<dyn Relay>,
    call_timeout: Duration,
    order: Mutex<()>,
}

impl SpeechLane {
    pub(crate) fn new(relay: Arc<dyn Relay>, call_timeout: Duration) -> Self {
        Self {
            relay,
            call_timeout,
            order: Mutex::new(()),
        }
    }

    pub(crate) async fn speak(
        &self,
        target: Option<SpeechTarget>,
        text: &str,
    ) -> Result<SpeakOutcome> {
        let Some(target) = target else {
            debug!("Dropping speech request, session not connected");
            return Ok(SpeakOutcome::NotConnected);
        };

        if text.trim().is_empty() {
            return Err(Error::InvalidRequest("speech text is empty".to_string()));
        }

        // tokio's Mutex is fair, so waiters are served in arrival order
        let _turn = self.order.lock().await;

        let ack = with_cap(
            self.call_timeout,
            "send_speech",
            self.relay
                .send_speech(&target.token, &target.session_id, text),
        )
        .await?;

        if ack.accepted {
            info!(role = %target.role, chars = text.len(), "Speech accepted");
            Ok(SpeakOutcome::Accepted)
        } else {
            info!(role = %target.role, "Speech declined by provider");
            Ok(SpeakOutcome::Declined)
        }
    }
}

/// Routes speak requests to the negotiator of the requested role
#[derive(Clone)]
pub struct SpeechDispatcher {
    patient: Negotiator,
    doctor: Negotiator,
}

impl SpeechDispatcher {
    pub fn new(patient: Negotiator, doctor: Negotiator) -> Self {
        Self { patient, doctor }
    }

    /// Speak `text` as `role`
    ///
    /// Relay failures come back as errors and leave the session state
    /// untouched.
    pub async fn speak(&self, role: Role, text: &str) -> Result<SpeakOutcome> {
        self.negotiator(role).speak(text).await
    }

    fn negotiator(&self, role: Role) -> &Negotiator {
        match role {
            Role::Patient => &self.patient,
            Role::Doctor => &self.doctor,
        }
    }
}
