//! Simulated streaming-avatar provider
//!
//! One object plays both the relay and the peer side so a test sees every
//! interaction in a single call trace. Tokens are `token-{avatar}`,
//! sessions are `session-{avatar}`, and `start_session` connects the
//! avatar's peer link the way the real provider would.

#![allow(dead_code)]

use async_trait::async_trait;
use duet_core::{
    ApiKey, CredentialCheck, Error, IceCandidate, IceServer, ProviderCredentials, Relay,
    RemoteSessionHandle, Result, Role, SdpType, SessionDescription, SessionToken, SpeechAck,
};
use duet_webrtc::{
    ConnectionState, LinkState, Negotiator, NegotiatorSettings, PeerEvent, PeerFactory, PeerLink,
    RemoteMedia, SessionEvent, SessionEventKind,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

pub const OFFER_SDP: &str = "v=0\r\no=- 4611731400430051336 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n";

/// Candidates each simulated peer discovers when it accepts an offer
pub const CANDIDATES_PER_PEER: usize = 2;

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn credentials() -> ProviderCredentials {
    ProviderCredentials::new(ApiKey::new("abc"), "p1", "d1")
}

/// Settings whose relay cap outlasts any gate a test holds closed
pub fn patient_settings() -> NegotiatorSettings {
    NegotiatorSettings {
        relay_call_timeout: Duration::from_secs(3600),
        ..Default::default()
    }
}

fn avatar_of(id: &str) -> String {
    id.trim_start_matches("token-")
        .trim_start_matches("session-")
        .to_string()
}

#[derive(Default)]
struct Script {
    failures: HashMap<(String, String), Error>,
    start_gates: HashMap<String, Arc<Notify>>,
    declined_speech: Vec<String>,
    stall_gathering: bool,
}

pub struct SimulatedProvider {
    credentials: ProviderCredentials,
    trace: Arc<Mutex<Vec<String>>>,
    script: Mutex<Script>,
    links: Mutex<HashMap<String, Arc<SimulatedLink>>>,
    answers: Mutex<HashMap<String, String>>,
    ice_servers: Mutex<HashMap<String, Vec<IceServer>>>,
}

impl SimulatedProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            credentials: credentials(),
            trace: Arc::new(Mutex::new(Vec::new())),
            script: Mutex::new(Script::default()),
            links: Mutex::new(HashMap::new()),
            answers: Mutex::new(HashMap::new()),
            ice_servers: Mutex::new(HashMap::new()),
        })
    }

    /// Make `op` fail for `avatar` until [`clear_failures`](Self::clear_failures)
    pub fn fail_on(&self, op: &str, avatar: &str, err: Error) {
        self.script
            .lock()
            .failures
            .insert((op.to_string(), avatar.to_string()), err);
    }

    pub fn clear_failures(&self) {
        self.script.lock().failures.clear();
    }

    /// Hold `start_session` for `avatar` until the returned gate is notified
    pub fn gate_start(&self, avatar: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.script
            .lock()
            .start_gates
            .insert(avatar.to_string(), gate.clone());
        gate
    }

    /// Peers created from now on never report gathering complete
    pub fn stall_gathering(&self) {
        self.script.lock().stall_gathering = true;
    }

    pub fn decline_speech(&self, avatar: &str) {
        self.script.lock().declined_speech.push(avatar.to_string());
    }

    /// Full call trace, candidate submissions included
    pub fn calls(&self) -> Vec<String> {
        self.trace.lock().clone()
    }

    /// Call trace without trickled candidates, whose timing is not fixed
    pub fn milestones(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| !call.starts_with("submit_ice_candidate"))
            .collect()
    }

    pub fn submitted_candidates(&self, avatar: &str) -> usize {
        let prefix = format!("submit_ice_candidate({},", avatar);
        self.calls()
            .iter()
            .filter(|call| call.starts_with(&prefix))
            .count()
    }

    /// Candidate lines submitted for `avatar`, in submission order
    pub fn submitted_candidate_lines(&self, avatar: &str) -> Vec<String> {
        let prefix = format!("submit_ice_candidate({}, ", avatar);
        self.calls()
            .iter()
            .filter_map(|call| call.strip_prefix(&prefix))
            .map(|rest| rest.trim_end_matches(')').to_string())
            .collect()
    }

    pub fn answer(&self, avatar: &str) -> Option<String> {
        self.answers.lock().get(avatar).cloned()
    }

    pub fn ice_servers_for(&self, avatar: &str) -> Vec<IceServer> {
        self.ice_servers
            .lock()
            .get(avatar)
            .cloned()
            .unwrap_or_default()
    }

    pub fn link(&self, avatar: &str) -> Option<Arc<SimulatedLink>> {
        self.links.lock().get(avatar).cloned()
    }

    /// Poll until `call` shows up in the trace
    pub async fn wait_for_call(&self, call: &str) {
        for _ in 0..1000 {
            if self.calls().iter().any(|c| c == call) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never happened; trace: {:?}", call, self.calls());
    }

    fn record(&self, call: String) {
        self.trace.lock().push(call);
    }

    fn scripted_failure(&self, op: &str, avatar: &str) -> Result<()> {
        match self
            .script
            .lock()
            .failures
            .get(&(op.to_string(), avatar.to_string()))
        {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Relay for SimulatedProvider {
    async fn issue_token(&self, avatar_id: &str) -> Result<SessionToken> {
        self.record(format!("issue_token({})", avatar_id));
        self.scripted_failure("issue_token", avatar_id)?;
        Ok(SessionToken::new(format!("token-{}", avatar_id)))
    }

    async fn create_session(&self, token: &SessionToken) -> Result<RemoteSessionHandle> {
        let avatar = avatar_of(token.as_str());
        self.record(format!("create_session({})", avatar));
        self.scripted_failure("create_session", &avatar)?;
        Ok(RemoteSessionHandle {
            session_id: format!("session-{}", avatar),
            sdp_offer: SessionDescription::offer(OFFER_SDP),
            ice_servers: Vec::new(),
        })
    }

    async fn submit_ice_candidate(
        &self,
        token: &SessionToken,
        _session_id: &str,
        candidate: &IceCandidate,
    ) -> Result<()> {
        let avatar = avatar_of(token.as_str());
        self.record(format!(
            "submit_ice_candidate({}, {})",
            avatar, candidate.candidate
        ));
        self.scripted_failure("submit_ice_candidate", &avatar)
    }

    async fn start_session(
        &self,
        token: &SessionToken,
        session_id: &str,
        sdp_answer: &str,
    ) -> Result<()> {
        let avatar = avatar_of(session_id);
        assert_eq!(avatar, avatar_of(token.as_str()));
        self.record(format!("start_session({})", avatar));
        self.scripted_failure("start_session", &avatar)?;

        let gate = self.script.lock().start_gates.get(&avatar).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if !sdp_answer.starts_with("v=0") {
            return Err(Error::from_provider_status(400, "malformed answer"));
        }
        self.answers
            .lock()
            .insert(avatar.clone(), sdp_answer.to_string());

        if let Some(link) = self.link(&avatar) {
            self.record(format!("connected({})", avatar));
            link.connect();
        }
        Ok(())
    }

    async fn send_speech(
        &self,
        token: &SessionToken,
        _session_id: &str,
        text: &str,
    ) -> Result<SpeechAck> {
        let avatar = avatar_of(token.as_str());
        self.record(format!("send_speech({}, {})", avatar, text));
        self.scripted_failure("send_speech", &avatar)?;
        let declined = self.script.lock().declined_speech.contains(&avatar);
        Ok(SpeechAck {
            accepted: !declined,
        })
    }

    async fn stop_session(&self, token: &SessionToken, _session_id: &str) -> Result<()> {
        let avatar = avatar_of(token.as_str());
        self.record(format!("stop_session({})", avatar));
        self.scripted_failure("stop_session", &avatar)
    }

    async fn test_credentials(&self, api_key: &ApiKey) -> Result<CredentialCheck> {
        self.record("test_credentials".to_string());
        Ok(CredentialCheck {
            valid: !api_key.is_blank(),
            detail: "simulated".to_string(),
        })
    }
}

#[async_trait]
impl PeerFactory for SimulatedProvider {
    async fn create(
        &self,
        role: Role,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerLink>> {
        let avatar = self.credentials.avatar_for(role).to_string();
        self.record(format!("create_peer({})", avatar));
        self.ice_servers
            .lock()
            .insert(avatar.clone(), ice_servers.to_vec());

        let link = Arc::new(SimulatedLink {
            avatar: avatar.clone(),
            events,
            stall_gathering: self.script.lock().stall_gathering,
            candidates: Mutex::new(Vec::new()),
            gathered: Mutex::new(false),
            closed: Mutex::new(false),
        });
        self.links.lock().insert(avatar, link.clone());
        Ok(link)
    }
}

/// Peer link that discovers a fixed set of host candidates
pub struct SimulatedLink {
    avatar: String,
    events: mpsc::UnboundedSender<PeerEvent>,
    stall_gathering: bool,
    candidates: Mutex<Vec<String>>,
    gathered: Mutex<bool>,
    closed: Mutex<bool>,
}

impl SimulatedLink {
    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    /// Candidates in the order the link discovered them
    pub fn discovered(&self) -> Vec<String> {
        self.candidates.lock().clone()
    }

    pub fn connect(&self) {
        self.emit(PeerEvent::StateChanged(LinkState::Connected));
        self.emit(PeerEvent::RemoteTrack(RemoteMedia::new(
            format!("video-{}", self.avatar),
            format!("stream-{}", self.avatar),
            "video",
        )));
    }

    pub fn disconnect(&self) {
        self.emit(PeerEvent::StateChanged(LinkState::Disconnected));
    }

    pub fn reconnect(&self) {
        self.emit(PeerEvent::StateChanged(LinkState::Connected));
    }

    pub fn fail(&self) {
        self.emit(PeerEvent::StateChanged(LinkState::Failed));
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl PeerLink for SimulatedLink {
    async fn accept_offer(&self, offer: &SessionDescription) -> Result<()> {
        if offer.sdp_type != SdpType::Offer || !offer.sdp.starts_with("v=0") {
            return Err(Error::Negotiation("not a valid offer".to_string()));
        }

        for n in 1..=CANDIDATES_PER_PEER {
            let candidate = format!(
                "candidate:{} 1 udp 2122260223 192.168.1.{} 5000{} typ host",
                n, n, n
            );
            self.candidates.lock().push(candidate.clone());
            self.emit(PeerEvent::CandidateDiscovered(IceCandidate {
                candidate,
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            }));
        }

        if !self.stall_gathering {
            *self.gathered.lock() = true;
            self.emit(PeerEvent::GatheringComplete);
        }
        Ok(())
    }

    async fn local_answer(&self) -> Result<String> {
        let mut sdp = String::from("v=0\r\no=- 1 2 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\n");
        for candidate in self.candidates.lock().iter() {
            sdp.push_str(&format!("a={}\r\n", candidate));
        }
        if *self.gathered.lock() {
            sdp.push_str("a=end-of-candidates\r\n");
        }
        Ok(sdp)
    }

    async fn close(&self) -> Result<()> {
        *self.closed.lock() = true;
        self.emit(PeerEvent::StateChanged(LinkState::Closed));
        Ok(())
    }
}

pub fn negotiator(
    provider: &Arc<SimulatedProvider>,
    role: Role,
    settings: NegotiatorSettings,
) -> (Negotiator, mpsc::UnboundedReceiver<SessionEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let negotiator = Negotiator::new(role, provider.clone(), provider.clone(), settings, tx);
    (negotiator, rx)
}

/// Wait until `negotiator` reaches `target`
pub async fn wait_for_state(negotiator: &Negotiator, target: ConnectionState) {
    let mut rx = negotiator.subscribe_state();
    let reached = tokio::time::timeout(Duration::from_secs(120), rx.wait_for(|s| *s == target))
        .await
        .map(|waited| waited.is_ok())
        .unwrap_or(false);
    assert!(
        reached,
        "{} never reached {}, stuck in {}",
        negotiator.role(),
        target,
        negotiator.state()
    );
}

/// Next event that is not remote media
pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(120), rx.recv())
            .await
            .expect("no event within timeout")
            .expect("event channel closed");
        if !matches!(event.kind, SessionEventKind::RemoteMedia(_)) {
            return event;
        }
    }
}
