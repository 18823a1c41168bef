//! Patient/doctor orchestration
//!
//! The [`Orchestrator`] owns one [`Negotiator`] per role and merges their
//! events into a single channel. Under [`StartupPolicy::Sequential`] the
//! doctor is initialized only after the patient reports Ready, which keeps
//! the provider from negotiating two sessions of one account at once.

use crate::dispatcher::{SpeakOutcome, SpeechDispatcher};
use crate::events::{SessionEvent, SessionEventKind};
use crate::negotiator::{Negotiator, NegotiatorSettings};
use crate::peer::PeerFactory;
use crate::state::ConnectionState;
use duet_core::config::NegotiationConfig;
use duet_core::{ProviderCredentials, Relay, Result, Role, StartupPolicy};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Where the pair is in its bring-up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorPhase {
    Idle,
    PatientNegotiating,
    PatientReady,
    DoctorNegotiating,
    BothReady,
    Failed,
}

impl fmt::Display for OrchestratorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OrchestratorPhase::Idle => "idle",
            OrchestratorPhase::PatientNegotiating => "patient_negotiating",
            OrchestratorPhase::PatientReady => "patient_ready",
            OrchestratorPhase::DoctorNegotiating => "doctor_negotiating",
            OrchestratorPhase::BothReady => "both_ready",
            OrchestratorPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Readiness flags observed from role events
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoleReadiness {
    pub patient_ready: bool,
    pub doctor_ready: bool,
    /// Latched by the first patient Ready (or at start under Concurrent)
    pub doctor_allowed_to_init: bool,
}

impl RoleReadiness {
    pub fn both_ready(&self) -> bool {
        self.patient_ready && self.doctor_ready
    }
}

#[derive(Default)]
struct Tracker {
    running: bool,
    readiness: RoleReadiness,
}

#[derive(Default)]
struct Lifecycle {
    running: bool,
    credentials: Option<ProviderCredentials>,
}

struct Shared {
    patient: Negotiator,
    doctor: Negotiator,
    policy: StartupPolicy,
    tracker: Mutex<Tracker>,
    phase: watch::Sender<OrchestratorPhase>,
    lifecycle: AsyncMutex<Lifecycle>,
    out: mpsc::UnboundedSender<SessionEvent>,
}

/// Brings up and tears down a patient/doctor session pair
pub struct Orchestrator {
    shared: Arc<Shared>,
    role_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Create an orchestrator and the receiver of its merged event stream
    pub fn new(
        relay: Arc<dyn Relay>,
        peers: Arc<dyn PeerFactory>,
        settings: NegotiatorSettings,
        policy: StartupPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (role_tx, role_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (phase, _) = watch::channel(OrchestratorPhase::Idle);

        let patient = Negotiator::new(
            Role::Patient,
            relay.clone(),
            peers.clone(),
            settings,
            role_tx.clone(),
        );
        let doctor = Negotiator::new(Role::Doctor, relay, peers, settings, role_tx);

        let orchestrator = Self {
            shared: Arc::new(Shared {
                patient,
                doctor,
                policy,
                tracker: Mutex::new(Tracker::default()),
                phase,
                lifecycle: AsyncMutex::new(Lifecycle::default()),
                out: out_tx,
            }),
            role_rx: Mutex::new(Some(role_rx)),
            pump: Mutex::new(None),
        };
        (orchestrator, out_rx)
    }

    /// Create an orchestrator with timeouts and policy from configuration
    pub fn from_config(
        relay: Arc<dyn Relay>,
        peers: Arc<dyn PeerFactory>,
        config: &NegotiationConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        Self::new(
            relay,
            peers,
            NegotiatorSettings::from(config),
            config.startup_policy,
        )
    }

    /// Start the pair; a no-op while already running
    ///
    /// The patient is initialized immediately. The doctor follows the
    /// startup policy. Precondition failures are returned and leave the
    /// orchestrator stopped, so `start` may be retried.
    pub async fn start(&self, credentials: &ProviderCredentials) -> Result<()> {
        self.ensure_pump();
        let shared = &self.shared;

        let mut lifecycle = shared.lifecycle.lock().await;
        if lifecycle.running {
            debug!("Orchestrator already running");
            return Ok(());
        }
        lifecycle.running = true;
        lifecycle.credentials = Some(credentials.clone());
        {
            let mut tracker = shared.tracker.lock();
            tracker.running = true;
            tracker.readiness = RoleReadiness::default();
        }

        info!(policy = %shared.policy, "Starting patient/doctor sessions");
        shared.set_phase(OrchestratorPhase::PatientNegotiating);

        let started = match shared.policy {
            StartupPolicy::Sequential => shared.patient.initialize(credentials).await,
            StartupPolicy::Concurrent => {
                shared.tracker.lock().readiness.doctor_allowed_to_init = true;
                let patient = shared.patient.initialize(credentials).await;
                let doctor = shared.doctor.initialize(credentials).await;
                patient.and(doctor)
            }
        };

        if let Err(err) = started {
            lifecycle.running = false;
            lifecycle.credentials = None;
            shared.tracker.lock().running = false;
            shared.set_phase(OrchestratorPhase::Failed);
            return Err(err);
        }
        Ok(())
    }

    /// Dispose both sessions and return to Idle
    pub async fn stop(&self) {
        let shared = &self.shared;
        let mut lifecycle = shared.lifecycle.lock().await;
        lifecycle.running = false;
        lifecycle.credentials = None;
        *shared.tracker.lock() = Tracker::default();

        tokio::join!(shared.patient.dispose(), shared.doctor.dispose());

        shared.set_phase(OrchestratorPhase::Idle);
        info!("Patient/doctor sessions stopped");
    }

    pub fn policy(&self) -> StartupPolicy {
        self.shared.policy
    }

    pub fn readiness(&self) -> RoleReadiness {
        self.shared.tracker.lock().readiness
    }

    pub fn phase(&self) -> OrchestratorPhase {
        *self.shared.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<OrchestratorPhase> {
        self.shared.phase.subscribe()
    }

    pub fn negotiator(&self, role: Role) -> &Negotiator {
        self.shared.negotiator(role)
    }

    /// Speech dispatcher bound to this pair
    pub fn dispatcher(&self) -> SpeechDispatcher {
        SpeechDispatcher::new(self.shared.patient.clone(), self.shared.doctor.clone())
    }

    pub async fn speak(&self, role: Role, text: &str) -> Result<SpeakOutcome> {
        self.negotiator(role).speak(text).await
    }

    fn ensure_pump(&self) {
        if let Some(role_rx) = self.role_rx.lock().take() {
            let handle = tokio::spawn(pump_role_events(self.shared.clone(), role_rx));
            *self.pump.lock() = Some(handle);
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

impl Shared {
    fn set_phase(&self, next: OrchestratorPhase) {
        let changed = self.phase.send_if_modified(|phase| {
            if *phase == next {
                false
            } else {
                *phase = next;
                true
            }
        });
        if changed {
            debug!(phase = %next, "Orchestrator phase");
        }
    }

    fn negotiator(&self, role: Role) -> &Negotiator {
        match role {
            Role::Patient => &self.patient,
            Role::Doctor => &self.doctor,
        }
    }

    /// Fold one role event into readiness
    ///
    /// Returns `None` when the pair is not running or the event belongs to
    /// a superseded negotiation, otherwise whether the doctor should be
    /// initialized now.
    fn record(&self, event: &SessionEvent) -> Option<bool> {
        let mut tracker = self.tracker.lock();
        if !tracker.running {
            debug!(role = %event.role, "Dropping event, orchestrator stopped");
            return None;
        }
        let current = self.negotiator(event.role).identity().generation;
        if event.generation != current {
            debug!(
                role = %event.role,
                generation = event.generation,
                current,
                "Dropping event from a superseded negotiation"
            );
            return None;
        }
        let readiness = &mut tracker.readiness;

        let start_doctor = match (event.role, &event.kind) {
            (Role::Patient, SessionEventKind::Ready) => {
                readiness.patient_ready = true;
                let first = !readiness.doctor_allowed_to_init;
                readiness.doctor_allowed_to_init = true;
                let next = if readiness.doctor_ready {
                    OrchestratorPhase::BothReady
                } else if first {
                    OrchestratorPhase::PatientReady
                } else if self.doctor.state() == ConnectionState::Failed {
                    OrchestratorPhase::Failed
                } else {
                    // doctor already underway; a patient reconnect does not rewind
                    OrchestratorPhase::DoctorNegotiating
                };
                self.set_phase(next);
                first && self.policy == StartupPolicy::Sequential
            }
            (Role::Doctor, SessionEventKind::Ready) => {
                readiness.doctor_ready = true;
                if readiness.patient_ready {
                    self.set_phase(OrchestratorPhase::BothReady);
                }
                false
            }
            (role, SessionEventKind::Error(_)) => {
                set_ready(readiness, role, false);
                self.set_phase(OrchestratorPhase::Failed);
                false
            }
            (role, SessionEventKind::Disconnected) => {
                set_ready(readiness, role, false);
                false
            }
            (_, SessionEventKind::RemoteMedia(_)) => false,
        };
        Some(start_doctor)
    }

    async fn start_doctor(&self) {
        let lifecycle = self.lifecycle.lock().await;
        if !lifecycle.running {
            return;
        }
        let Some(credentials) = lifecycle.credentials.as_ref() else {
            return;
        };

        info!("Patient connected, starting doctor");
        self.set_phase(OrchestratorPhase::DoctorNegotiating);
        if let Err(e) = self.doctor.initialize(credentials).await {
            warn!(error = %e, "Doctor could not start");
        }
    }
}

fn set_ready(readiness: &mut RoleReadiness, role: Role, ready: bool) {
    match role {
        Role::Patient => readiness.patient_ready = ready,
        Role::Doctor => readiness.doctor_ready = ready,
    }
}

async fn pump_role_events(shared: Arc<Shared>, mut role_rx: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = role_rx.recv().await {
        let Some(start_doctor) = shared.record(&event) else {
            continue;
        };

        let _ = shared.out.send(event);

        if start_doctor {
            shared.start_doctor().await;
        }
    }
}
