//! FETS Point call CLI

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fets_call_core::prelude::*;
use fets_call_core::signaling::{MAX_CANDIDATE_LENGTH, MAX_SDP_LENGTH, SIGNAL_EVENT};
use rand::Rng;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Staff identity on the signaling channel (random when omitted)
    #[arg(short, long, env = "FETS_IDENTITY")]
    identity: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an in-process mesh call against simulated colleagues
    Demo {
        /// Comma-separated identities to call
        #[arg(long, value_delimiter = ',', required = true)]
        participants: Vec<String>,

        /// Call without video
        #[arg(long)]
        audio_only: bool,

        /// How long to stay in the call before hanging up
        #[arg(long, default_value_t = 500)]
        hold_ms: u64,
    },

    /// Parse and validate a signaling envelope
    Inspect {
        /// Envelope JSON, bare or wrapped in a broadcast frame
        json: String,
    },

    /// Show status and available commands
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fets_call=info")),
        )
        .init();

    let cli = Cli::parse();
    let identity = cli.identity.unwrap_or_else(generate_random_identity);

    match cli.command {
        Commands::Demo {
            participants,
            audio_only,
            hold_ms,
        } => {
            let call_type = if audio_only {
                CallType::Audio
            } else {
                CallType::Video
            };
            handle_demo(&identity, &participants, call_type, Duration::from_millis(hold_ms))
                .await?;
        }
        Commands::Inspect { json } => {
            println!("{}", inspect(&json)?);
        }
        Commands::Status => handle_status(),
    }

    Ok(())
}

type Manager = CallManager<ChannelTransport<StaffId>>;

async fn spawn_client(hub: &BroadcastHub, name: &str) -> Result<Manager> {
    let signaling = SignalingHandler::new(Arc::new(hub.subscribe()), StaffId::new(name));
    let manager = CallManager::new(
        signaling,
        Arc::new(SyntheticDevices::new(name)),
        Arc::new(LoopbackPeerFactory::new()),
        CallManagerConfig {
            setup_timeout: Some(Duration::from_secs(10)),
            ..Default::default()
        },
    )
    .await;
    manager
        .start()
        .await
        .with_context(|| format!("starting client {name}"))?;
    Ok(manager)
}

/// Answer every incoming call
fn auto_answer(manager: Manager) {
    let mut events = manager.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let CallEvent::IncomingCall { caller, .. } = event {
                tracing::info!(callee = %manager.local(), %caller, "Auto-answering");
                if let Err(e) = manager.answer_call().await {
                    tracing::warn!(callee = %manager.local(), error = %e, "Auto-answer failed");
                }
            }
        }
    });
}

async fn handle_demo(
    identity: &str,
    participants: &[String],
    call_type: CallType,
    hold: Duration,
) -> Result<()> {
    let targets = distinct_targets(identity, participants)?;
    println!("🔗 Using identity: {identity}");
    println!("📞 Calling {} ({call_type})...", targets.join(", "));

    let hub = BroadcastHub::default();
    let mut callees = Vec::with_capacity(targets.len());
    for name in &targets {
        let callee = spawn_client(&hub, name).await?;
        auto_answer(callee.clone());
        callees.push(callee);
    }
    let caller = spawn_client(&hub, identity).await?;

    let mut state_rx = caller.watch_state();
    let call_id = caller
        .start_call(targets.iter().map(StaffId::new).collect(), call_type)
        .await?;
    println!("📞 Call started with ID: {call_id}");

    let expected = targets.len();
    let connected = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let state = state_rx.borrow_and_update().clone();
            println!("   {}", describe(&state));
            if state.remote_streams.len() == expected || state.phase == CallPhase::Idle {
                return state;
            }
            if state_rx.changed().await.is_err() {
                return state;
            }
        }
    })
    .await
    .context("participants did not connect in time")?;

    if connected.phase == CallPhase::Idle {
        bail!("call ended before everyone connected");
    }
    println!("✅ Connected to {expected} participant(s)");

    tokio::time::sleep(hold).await;
    if let Some(duration) = caller.state().duration() {
        println!("⏱️  In call for {} ms", duration.num_milliseconds());
    }

    caller.end_call().await;
    caller.flush().await;
    for callee in &callees {
        let mut rx = callee.watch_state();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.phase == CallPhase::Idle))
            .await
            .context("callee did not hang up")?
            .context("callee stopped")?;
    }
    println!("   {}", describe(&caller.state()));
    println!("📞 Call ended");

    caller.shutdown().await;
    for callee in callees {
        callee.shutdown().await;
    }
    Ok(())
}

fn distinct_targets(identity: &str, participants: &[String]) -> Result<Vec<String>> {
    let mut targets: Vec<String> = Vec::new();
    for name in participants.iter().map(|p| p.trim()) {
        if name.is_empty() || name == identity || targets.iter().any(|t| t == name) {
            continue;
        }
        targets.push(name.to_string());
    }
    if targets.is_empty() {
        bail!("no participants to call besides {identity}");
    }
    Ok(targets)
}

fn describe(state: &CallState<StaffId>) -> String {
    let mut line = format!("[{}]", state.phase);
    if let Some(call_type) = state.call_type {
        line.push_str(&format!(" {call_type}"));
    }
    if let Some(caller) = &state.caller_id {
        line.push_str(&format!(" from {caller}"));
    }
    if !state.participants.is_empty() {
        let names: Vec<String> = state.participants.iter().map(ToString::to_string).collect();
        line.push_str(&format!(" with {}", names.join(", ")));
    }
    if !state.remote_streams.is_empty() {
        let streams: Vec<&str> = state.remote_streams.keys().map(String::as_str).collect();
        line.push_str(&format!(" | receiving {}", streams.join(", ")));
    }
    line
}

#[derive(Deserialize)]
struct Frame {
    event: String,
    payload: serde_json::Value,
}

fn inspect(json: &str) -> Result<String> {
    let value: serde_json::Value = serde_json::from_str(json).context("not valid JSON")?;
    let value = if value.get("payload").is_some() && value.get("event").is_some() {
        let frame: Frame = serde_json::from_value(value)?;
        if frame.event != SIGNAL_EVENT {
            bail!("frame event is {:?}, expected {SIGNAL_EVENT:?}", frame.event);
        }
        frame.payload
    } else {
        value
    };

    let envelope: SignalEnvelope<StaffId> =
        serde_json::from_value(value).context("not a signaling envelope")?;
    envelope.validate()?;

    Ok(format!(
        "✅ {} from {} to {}\n{}",
        envelope.payload.kind(),
        envelope.from,
        envelope.to,
        serde_json::to_string_pretty(&envelope)?
    ))
}

fn handle_status() {
    let transport = TransportConfig::default();
    println!("📊 FETS Point Call Status");
    println!("=========================");
    println!("✅ Call orchestrator: Ready");
    println!("✅ Loopback peers: Available");
    println!("✅ WebRTC peers: Available (webrtc-backend feature)");
    println!();
    println!("Signaling channel: {}", transport.channel);
    println!("Signaling event:   {SIGNAL_EVENT}");
    println!("Max frame size:    {} bytes", transport.max_message_size);
    println!("Max SDP size:      {MAX_SDP_LENGTH} bytes");
    println!("Max candidate:     {MAX_CANDIDATE_LENGTH} bytes");
    println!();
    println!("Available commands:");
    println!("  fets-call demo --participants a,b [options]  - Simulated mesh call");
    println!("  fets-call inspect <json>                     - Validate an envelope");
    println!("  fets-call status                             - Show this status");
    println!();
    println!("Use 'fets-call --help' for detailed options");
}

fn generate_random_identity() -> String {
    const CENTERS: &[&str] = &[
        "kochi", "calicut", "trivandrum", "thrissur", "kannur", "kollam", "palakkad", "kottayam",
    ];
    const ROLES: &[&str] = &["desk", "proctor", "admin", "invigilator", "support"];

    let mut rng = rand::thread_rng();
    format!(
        "{}-{}-{:04}",
        CENTERS[rng.gen_range(0..CENTERS.len())],
        ROLES[rng.gen_range(0..ROLES.len())],
        rng.gen_range(0..10_000)
    )
}
