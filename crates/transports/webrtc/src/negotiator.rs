//! Per-role session negotiator
//!
//! A [`Negotiator`] owns one peer connection and drives it from token
//! issuance to Connected:
//!
//! 1. `issue_token(avatar)` and `create_session(token)` through the relay
//! 2. build a local peer with the provider's ICE servers (STUN fallback)
//! 3. accept the provider offer and set a local answer
//! 4. trickle every local candidate to the provider as it is found
//! 5. wait for ICE gathering to complete, or give up waiting after the
//!    gathering timeout and answer with what was gathered so far
//! 6. `start_session(answer)`, then follow peer connectivity
//!
//! Each negotiation attempt carries a generation number. `dispose()` and
//! re-initialization bump it, so results that arrive for an older attempt
//! are dropped instead of touching the current one.

use crate::dispatcher::{SpeakOutcome, SpeechLane, SpeechTarget};
use crate::events::{SessionEvent, SessionEventKind};
use crate::peer::{LinkState, PeerEvent, PeerFactory, PeerLink};
use crate::state::{ConnectionState, StateMachine};
use duet_core::config::NegotiationConfig;
use duet_core::{
    short_id, Error, IceCandidate, ProviderCredentials, Relay, Result, Role, SessionToken,
};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default upper bound on waiting for local ICE gathering
pub const DEFAULT_ICE_GATHERING_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default cap on a single relay call
pub const DEFAULT_RELAY_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Timing knobs for a negotiator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatorSettings {
    /// How long to wait for gathering before answering anyway; not an error
    pub ice_gathering_timeout: Duration,
    /// Cap on every relay call; exceeding it fails the negotiation
    pub relay_call_timeout: Duration,
}

impl Default for NegotiatorSettings {
    fn default() -> Self {
        Self {
            ice_gathering_timeout: DEFAULT_ICE_GATHERING_TIMEOUT,
            relay_call_timeout: DEFAULT_RELAY_CALL_TIMEOUT,
        }
    }
}

impl From<&NegotiationConfig> for NegotiatorSettings {
    fn from(config: &NegotiationConfig) -> Self {
        Self {
            ice_gathering_timeout: config.ice_gathering_timeout(),
            relay_call_timeout: config.relay_call_timeout(),
        }
    }
}

/// Which negotiation attempt of which role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionIdentity {
    pub role: Role,
    pub generation: u64,
}

/// Run `fut`, turning an overrun of `cap` into [`Error::Timeout`]
pub(crate) async fn with_cap<T, F>(cap: Duration, op: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(cap, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(format!(
            "{} exceeded {} ms",
            op,
            cap.as_millis()
        ))),
    }
}

/// Provider session created by the current attempt
#[derive(Clone)]
struct ActiveSession {
    token: SessionToken,
    session_id: String,
}

/// Resources detached from a finished or superseded attempt
#[derive(Default)]
struct Leftovers {
    session: Option<ActiveSession>,
    link: Option<Arc<dyn PeerLink>>,
}

#[derive(Default)]
struct Inner {
    generation: u64,
    session: Option<ActiveSession>,
    link: Option<Arc<dyn PeerLink>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Inner {
    /// Abort every task of the current attempt and detach its resources
    fn detach(&mut self) -> Leftovers {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        Leftovers {
            session: self.session.take(),
            link: self.link.take(),
        }
    }
}

/// Why a negotiation attempt stopped early
enum Interrupt {
    /// Disposed, re-initialized or already failed elsewhere
    Stale,
    Failed(Error),
}

impl From<Error> for Interrupt {
    fn from(err: Error) -> Self {
        Interrupt::Failed(err)
    }
}

struct Shared {
    role: Role,
    relay: Arc<dyn Relay>,
    peers: Arc<dyn PeerFactory>,
    settings: NegotiatorSettings,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: StateMachine,
    lane: SpeechLane,
    inner: Mutex<Inner>,
}

/// Drives one role's provider session
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct Negotiator {
    shared: Arc<Shared>,
}

impl Negotiator {
    /// Create a negotiator for `role`
    ///
    /// # Arguments
    ///
    /// * `relay` - Relay used for every provider call
    /// * `peers` - Builds the local peer connection
    /// * `settings` - Gathering and relay-call timeouts
    /// * `events` - Receives Ready/Error/Disconnected/RemoteMedia for `role`
    pub fn new(
        role: Role,
        relay: Arc<dyn Relay>,
        peers: Arc<dyn PeerFactory>,
        settings: NegotiatorSettings,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let lane = SpeechLane::new(relay.clone(), settings.relay_call_timeout);
        Self {
            shared: Arc::new(Shared {
                role,
                relay,
                peers,
                settings,
                events,
                state: StateMachine::new(),
                lane,
                inner: Mutex::new(Inner::default()),
            }),
        }
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.current()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Provider session id of the current attempt, once created
    pub fn session_id(&self) -> Option<String> {
        self.shared
            .inner
            .lock()
            .session
            .as_ref()
            .map(|s| s.session_id.clone())
    }

    pub fn identity(&self) -> SessionIdentity {
        SessionIdentity {
            role: self.shared.role,
            generation: self.shared.inner.lock().generation,
        }
    }

    /// Begin negotiating unless a session is already live
    ///
    /// Returns once the attempt is scheduled; progress is reported through
    /// the state watch and the event channel. Missing credentials fail
    /// the role before any network call and are also returned here.
    pub async fn initialize(&self, credentials: &ProviderCredentials) -> Result<()> {
        let shared = &self.shared;
        let role = shared.role;

        if shared.state.current().is_live() {
            debug!(role = %role, state = %shared.state.current(), "Session already live");
            return Ok(());
        }

        if let Err(err) = credentials.validate_for(role) {
            let generation = shared.inner.lock().generation;
            if shared.state.transition(ConnectionState::Failed) {
                error!(role = %role, error = %err, "Cannot negotiate");
                shared.emit(generation, SessionEventKind::Error(err.to_string()));
            }
            return Err(err);
        }
        let avatar_id = credentials.avatar_for(role).trim().to_string();

        let (id, leftovers) = {
            let mut inner = shared.inner.lock();
            if shared.state.current().is_live() {
                return Ok(());
            }
            inner.generation += 1;
            let leftovers = inner.detach();
            if shared.state.current() == ConnectionState::Failed {
                shared.state.transition(ConnectionState::Closed);
            }
            shared.state.transition(ConnectionState::Negotiating);
            let id = SessionIdentity {
                role,
                generation: inner.generation,
            };
            (id, leftovers)
        };

        info!(role = %role, generation = id.generation, "Starting negotiation");
        shared.release(leftovers).await;

        let mut inner = shared.inner.lock();
        if inner.generation != id.generation {
            debug!(role = %role, generation = id.generation, "Negotiation superseded before start");
            return Ok(());
        }
        inner
            .tasks
            .push(tokio::spawn(negotiate(shared.clone(), id, avatar_id)));
        Ok(())
    }

    /// Tear the session down; safe to call at any time, any number of times
    ///
    /// Stopping the provider session is best-effort and only logged on
    /// failure.
    pub async fn dispose(&self) {
        let shared = &self.shared;
        let leftovers = {
            let mut inner = shared.inner.lock();
            inner.generation += 1;
            let leftovers = inner.detach();
            shared.state.transition(ConnectionState::Closed);
            leftovers
        };

        if leftovers.link.is_some() || leftovers.session.is_some() {
            info!(role = %shared.role, "Disposing session");
        }
        shared.release(leftovers).await;
    }

    /// Speak `text` if Connected; otherwise report NotConnected
    pub async fn speak(&self, text: &str) -> Result<SpeakOutcome> {
        let target = self.shared.speech_target();
        self.shared.lane.speak(target, text).await
    }
}

impl Shared {
    fn emit(&self, generation: u64, kind: SessionEventKind) {
        let _ = self.events.send(SessionEvent::new(self.role, generation, kind));
    }

    fn is_current(&self, id: SessionIdentity) -> bool {
        self.inner.lock().generation == id.generation
    }

    fn is_active(&self, id: SessionIdentity) -> bool {
        let inner = self.inner.lock();
        inner.generation == id.generation && self.state.current().is_live()
    }

    fn checkpoint(&self, id: SessionIdentity) -> std::result::Result<(), Interrupt> {
        if self.is_active(id) {
            Ok(())
        } else {
            Err(Interrupt::Stale)
        }
    }

    fn transition_if_current(&self, id: SessionIdentity, next: ConnectionState) -> bool {
        let inner = self.inner.lock();
        inner.generation == id.generation && self.state.transition(next)
    }

    fn speech_target(&self) -> Option<SpeechTarget> {
        let inner = self.inner.lock();
        if self.state.current() != ConnectionState::Connected {
            return None;
        }
        inner.session.as_ref().map(|session| SpeechTarget {
            role: self.role,
            token: session.token.clone(),
            session_id: session.session_id.clone(),
        })
    }

    /// Mark attempt `id` Failed and report it once
    fn fail(&self, id: SessionIdentity, err: Error) {
        let link = {
            let mut inner = self.inner.lock();
            if inner.generation != id.generation || !self.state.transition(ConnectionState::Failed)
            {
                return;
            }
            inner.link.take()
        };

        error!(role = %self.role, generation = id.generation, error = %err, "Negotiation failed");
        self.emit(id.generation, SessionEventKind::Error(err.to_string()));

        if let Some(link) = link {
            tokio::spawn(close_link(self.role, link));
        }
    }

    async fn release(&self, leftovers: Leftovers) {
        if let Some(link) = leftovers.link {
            close_link(self.role, link).await;
        }

        if let Some(session) = leftovers.session {
            let stopped = with_cap(
                self.settings.relay_call_timeout,
                "stop_session",
                self.relay.stop_session(&session.token, &session.session_id),
            )
            .await;
            match stopped {
                Ok(()) => info!(
                    role = %self.role,
                    session_id = %short_id(&session.session_id),
                    "Provider session stopped"
                ),
                Err(e) => warn!(
                    role = %self.role,
                    session_id = %short_id(&session.session_id),
                    error = %e,
                    "Failed to stop provider session"
                ),
            }
        }
    }
}

async fn close_link(role: Role, link: Arc<dyn PeerLink>) {
    if let Err(e) = link.close().await {
        warn!(role = %role, error = %e, "Failed to close peer connection");
    }
}

async fn negotiate(shared: Arc<Shared>, id: SessionIdentity, avatar_id: String) {
    match run(&shared, id, &avatar_id).await {
        Ok(()) => {}
        Err(Interrupt::Stale) => {
            debug!(role = %id.role, generation = id.generation, "Dropping stale negotiation")
        }
        Err(Interrupt::Failed(err)) => shared.fail(id, err),
    }
}

async fn run(
    shared: &Arc<Shared>,
    id: SessionIdentity,
    avatar_id: &str,
) -> std::result::Result<(), Interrupt> {
    let role = shared.role;
    let cap = shared.settings.relay_call_timeout;

    let token = with_cap(cap, "issue_token", shared.relay.issue_token(avatar_id)).await?;
    shared.checkpoint(id)?;
    debug!(role = %role, "Session token issued");

    let handle = with_cap(cap, "create_session", shared.relay.create_session(&token)).await?;
    shared.checkpoint(id)?;
    let session_id = handle.session_id.clone();
    {
        let mut inner = shared.inner.lock();
        if inner.generation != id.generation {
            return Err(Interrupt::Stale);
        }
        inner.session = Some(ActiveSession {
            token: token.clone(),
            session_id: session_id.clone(),
        });
    }
    info!(
        role = %role,
        session_id = %short_id(&session_id),
        ice_servers = handle.ice_servers.len(),
        "Provider session created"
    );

    let (peer_tx, peer_rx) = mpsc::unbounded_channel();
    let link = shared
        .peers
        .create(role, &handle.effective_ice_servers(), peer_tx)
        .await?;

    let (gathered_tx, mut gathered_rx) = watch::channel(false);
    let (candidate_tx, candidate_rx) = mpsc::unbounded_channel();
    let adopted = {
        let mut inner = shared.inner.lock();
        if inner.generation == id.generation && shared.state.current().is_live() {
            inner.link = Some(link.clone());
            inner.tasks.push(tokio::spawn(pump_peer_events(
                shared.clone(),
                id,
                peer_rx,
                gathered_tx,
                candidate_tx,
            )));
            inner.tasks.push(tokio::spawn(forward_candidates(
                shared.clone(),
                id,
                token.clone(),
                session_id.clone(),
                candidate_rx,
            )));
            true
        } else {
            false
        }
    };
    if !adopted {
        close_link(role, link).await;
        return Err(Interrupt::Stale);
    }

    link.accept_offer(&handle.sdp_offer).await?;
    shared.checkpoint(id)?;

    let gathering = tokio::time::timeout(
        shared.settings.ice_gathering_timeout,
        gathered_rx.wait_for(|done| *done),
    )
    .await
    .map(|waited| waited.is_ok());
    match gathering {
        Ok(true) => debug!(role = %role, "ICE gathering complete"),
        Ok(false) => debug!(role = %role, "Peer event stream ended before gathering completed"),
        Err(_) => info!(
            role = %role,
            timeout_ms = shared.settings.ice_gathering_timeout.as_millis() as u64,
            "ICE gathering still running, answering with candidates gathered so far"
        ),
    }
    shared.checkpoint(id)?;

    let answer = link.local_answer().await?;
    shared.checkpoint(id)?;

    with_cap(
        cap,
        "start_session",
        shared.relay.start_session(&token, &session_id, &answer),
    )
    .await?;
    shared.checkpoint(id)?;

    info!(role = %role, session_id = %short_id(&session_id), "Session started");
    Ok(())
}

async fn pump_peer_events(
    shared: Arc<Shared>,
    id: SessionIdentity,
    mut peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    gathered_tx: watch::Sender<bool>,
    candidate_tx: mpsc::UnboundedSender<IceCandidate>,
) {
    let role = shared.role;

    while let Some(event) = peer_rx.recv().await {
        if !shared.is_current(id) {
            break;
        }

        match event {
            PeerEvent::CandidateDiscovered(candidate) => {
                let _ = candidate_tx.send(candidate);
            }
            PeerEvent::GatheringComplete => {
                gathered_tx.send_replace(true);
            }
            PeerEvent::StateChanged(LinkState::Connected) => {
                if shared.transition_if_current(id, ConnectionState::Connected) {
                    info!(role = %role, "Peer connected");
                    shared.emit(id.generation, SessionEventKind::Ready);
                }
            }
            PeerEvent::StateChanged(LinkState::Disconnected) => {
                if shared.transition_if_current(id, ConnectionState::Disconnected) {
                    warn!(role = %role, "Peer disconnected");
                    shared.emit(id.generation, SessionEventKind::Disconnected);
                }
            }
            PeerEvent::StateChanged(LinkState::Failed) => {
                shared.fail(
                    id,
                    Error::ConnectionFailed("peer connection failed".to_string()),
                );
            }
            PeerEvent::StateChanged(other) => {
                debug!(role = %role, state = ?other, "Peer state");
            }
            PeerEvent::RemoteTrack(media) => {
                debug!(role = %role, kind = %media.kind, "Remote media");
                shared.emit(id.generation, SessionEventKind::RemoteMedia(media));
            }
        }
    }
}

/// Trickle candidates to the provider one at a time, in discovery order
async fn forward_candidates(
    shared: Arc<Shared>,
    id: SessionIdentity,
    token: SessionToken,
    session_id: String,
    mut candidate_rx: mpsc::UnboundedReceiver<IceCandidate>,
) {
    while let Some(candidate) = candidate_rx.recv().await {
        if !shared.is_active(id) {
            break;
        }

        let submitted = with_cap(
            shared.settings.relay_call_timeout,
            "submit_ice_candidate",
            shared
                .relay
                .submit_ice_candidate(&token, &session_id, &candidate),
        )
        .await;
        if let Err(e) = submitted {
            warn!(role = %shared.role, error = %e, "Failed to submit ICE candidate");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_config() {
        let config = NegotiationConfig {
            ice_gathering_timeout_ms: 250,
            relay_call_timeout_ms: 1500,
            ..Default::default()
        };
        let settings = NegotiatorSettings::from(&config);
        assert_eq!(settings.ice_gathering_timeout, Duration::from_millis(250));
        assert_eq!(settings.relay_call_timeout, Duration::from_millis(1500));

        let defaults = NegotiatorSettings::from(&NegotiationConfig::default());
        assert_eq!(defaults, NegotiatorSettings::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cap_turns_overrun_into_timeout() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        };
        let err = with_cap(Duration::from_secs(10), "issue_token", slow)
            .await
            .unwrap_err();
        assert_eq!(err, Error::Timeout("issue_token exceeded 10000 ms".to_string()));
    }

    #[tokio::test]
    async fn test_cap_passes_result_through() {
        let ok = with_cap(Duration::from_secs(1), "start_session", async { Ok(7) }).await;
        assert_eq!(ok, Ok(7));

        let failed: Result<()> = with_cap(Duration::from_secs(1), "start_session", async {
            Err(Error::ProviderNotFound("no such avatar".to_string()))
        })
        .await;
        assert!(matches!(failed, Err(Error::ProviderNotFound(_))));
    }
}
