//! Duet command line
//!
//! Brings up a patient/doctor avatar pair through a running relay, or
//! checks that the relay, the API key and both avatars work.
//!
//! # Usage
//!
//! ```bash
//! # Connect both avatars and have each say one line once ready
//! duet run \
//!     --api-key "$DUET_PROVIDER_API_KEY" \
//!     --patient-avatar Anna_public_3_20240108 \
//!     --doctor-avatar Tyler-incasualsuit-20220721 \
//!     --doctor-says "How are you feeling today?"
//!
//! # Check credentials and create/stop one session per avatar
//! duet diagnose --relay-url http://127.0.0.1:8080 \
//!     --api-key ... --patient-avatar ... --doctor-avatar ...
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use duet_core::{
    short_id, ApiKey, Config, ProviderCredentials, Relay, Role, StartupPolicy,
};
use duet_relay::HttpRelayClient;
use duet_webrtc::{
    Orchestrator, OrchestratorPhase, SessionEvent, SessionEventKind, SpeakOutcome,
    WebRtcPeerFactory,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Patient/doctor avatar sessions through a Duet relay
#[derive(Parser)]
#[command(name = "duet")]
#[command(author, version)]
#[command(about = "Run and diagnose patient/doctor avatar sessions")]
struct Args {
    /// TOML configuration file; `DUET_*` variables still override it
    #[arg(short, long, global = true, env = "DUET_CONFIG")]
    config: Option<PathBuf>,

    /// Relay base URL (overrides configuration)
    #[arg(long, global = true)]
    relay_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

/// Credentials and the two personas
#[derive(clap::Args)]
struct Personas {
    /// Provider API key
    #[arg(long, env = "DUET_PROVIDER_API_KEY", hide_env_values = true)]
    api_key: String,

    /// Avatar id rendering the patient
    #[arg(long, env = "DUET_PATIENT_AVATAR")]
    patient_avatar: String,

    /// Avatar id rendering the doctor
    #[arg(long, env = "DUET_DOCTOR_AVATAR")]
    doctor_avatar: String,
}

impl Personas {
    fn credentials(&self) -> ProviderCredentials {
        ProviderCredentials::new(
            ApiKey::new(self.api_key.clone()),
            self.patient_avatar.clone(),
            self.doctor_avatar.clone(),
        )
    }
}

#[derive(Subcommand)]
enum Command {
    /// Connect both avatars and stream until Ctrl+C
    Run {
        #[command(flatten)]
        personas: Personas,

        /// Startup order: sequential or concurrent (overrides configuration)
        #[arg(long)]
        policy: Option<StartupPolicy>,

        /// Line for the patient to speak once both avatars are ready
        #[arg(long)]
        patient_says: Option<String>,

        /// Line for the doctor to speak once both avatars are ready
        #[arg(long)]
        doctor_says: Option<String>,
    },

    /// Check the API key, then create and stop a session per avatar
    Diagnose {
        #[command(flatten)]
        personas: Personas,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(url) = args.relay_url {
        config.relay.url = url;
    }

    match args.command {
        Command::Run {
            personas,
            policy,
            patient_says,
            doctor_says,
        } => {
            if let Some(policy) = policy {
                config.negotiation.startup_policy = policy;
            }
            let lines = [(Role::Patient, patient_says), (Role::Doctor, doctor_says)];
            run(&config, &personas, lines).await
        }
        Command::Diagnose { personas } => diagnose(&config, &personas).await,
    }
}

async fn connect_relay(config: &Config) -> Result<HttpRelayClient> {
    let relay = HttpRelayClient::new(
        config.relay.url.clone(),
        config.negotiation.relay_call_timeout(),
    )
    .context("Invalid relay URL")?;

    match relay.health_check().await {
        Ok(true) => info!(relay = %relay.base_url(), "Relay reachable"),
        Ok(false) => warn!(relay = %relay.base_url(), "Relay health check failed"),
        Err(e) => warn!(relay = %relay.base_url(), error = %e, "Relay unreachable"),
    }
    Ok(relay)
}

async fn run(
    config: &Config,
    personas: &Personas,
    lines: [(Role, Option<String>); 2],
) -> Result<()> {
    let relay = connect_relay(config).await?;
    let credentials = personas.credentials();

    let (orchestrator, mut events) = Orchestrator::from_config(
        Arc::new(relay),
        Arc::new(WebRtcPeerFactory::new()),
        &config.negotiation,
    );
    info!(policy = %orchestrator.policy(), "Starting avatar sessions");
    orchestrator
        .start(&credentials)
        .await
        .context("Failed to start avatar sessions")?;

    let mut phase = orchestrator.subscribe_phase();
    let mut spoken = false;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => log_event(&event),
                None => break,
            },
            changed = phase.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *phase.borrow_and_update();
                info!(phase = %current, "Session pair");
                match current {
                    OrchestratorPhase::BothReady if !spoken => {
                        spoken = true;
                        speak_lines(&orchestrator, &lines).await;
                    }
                    OrchestratorPhase::Failed => {
                        warn!("A session failed; press Ctrl+C to stop the other one");
                    }
                    _ => {}
                }
            },
            _ = signal::ctrl_c() => {
                info!("Ctrl+C received, stopping sessions");
                break;
            }
        }
    }

    orchestrator.stop().await;
    Ok(())
}

fn log_event(event: &SessionEvent) {
    match &event.kind {
        SessionEventKind::Ready => info!(role = %event.role, "Avatar connected"),
        SessionEventKind::Disconnected => warn!(role = %event.role, "Avatar disconnected"),
        SessionEventKind::Error(message) => error!(role = %event.role, "Avatar session failed: {}", message),
        SessionEventKind::RemoteMedia(media) => info!(
            role = %event.role,
            kind = %media.kind,
            track_id = %media.track_id,
            "Receiving avatar media"
        ),
    }
}

async fn speak_lines(orchestrator: &Orchestrator, lines: &[(Role, Option<String>)]) {
    let dispatcher = orchestrator.dispatcher();
    for (role, line) in lines {
        let Some(text) = line else {
            continue;
        };
        match dispatcher.speak(*role, text).await {
            Ok(SpeakOutcome::Accepted) => info!(role = %role, "Line accepted"),
            Ok(outcome) => warn!(role = %role, ?outcome, "Line not spoken"),
            Err(e) => warn!(role = %role, error = %e, "Speak request failed"),
        }
    }
}

async fn diagnose(config: &Config, personas: &Personas) -> Result<()> {
    let relay = connect_relay(config).await?;
    println!("Relay: {}", relay.base_url());

    let check = relay
        .test_credentials(&ApiKey::new(personas.api_key.clone()))
        .await
        .context("Credential check failed")?;
    println!(
        "  API key: {} ({})",
        if check.valid { "valid" } else { "rejected" },
        check.detail
    );
    if !check.valid {
        bail!("provider rejected the API key");
    }

    let credentials = personas.credentials();
    let mut failed = Vec::new();
    for role in Role::ALL {
        let avatar_id = credentials.avatar_for(role);
        match probe_avatar(&relay, avatar_id).await {
            Ok(session_id) => println!(
                "  {} ({}): session {} created and stopped",
                role,
                avatar_id,
                short_id(&session_id)
            ),
            Err(e) => {
                let origin = if e.is_provider_error() { "provider" } else { "relay" };
                println!(
                    "  {} ({}): {} [{} {:?}]",
                    role,
                    avatar_id,
                    e,
                    origin,
                    e.kind()
                );
                failed.push(role);
            }
        }
    }

    if !failed.is_empty() {
        bail!("{} of {} avatars failed", failed.len(), Role::ALL.len());
    }
    println!("All checks passed");
    Ok(())
}

/// Create and immediately stop a session for `avatar_id`
async fn probe_avatar(relay: &dyn Relay, avatar_id: &str) -> duet_core::Result<String> {
    let token = relay.issue_token(avatar_id).await?;
    let handle = relay.create_session(&token).await?;
    if let Err(e) = relay.stop_session(&token, &handle.session_id).await {
        warn!(session_id = %short_id(&handle.session_id), error = %e, "Failed to stop probe session");
    }
    Ok(handle.session_id)
}
