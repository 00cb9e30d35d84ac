//! Quadcall CLI Application

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use quadcall_core::prelude::*;
use quadcall_core::{CameraSwitch, MemoryTransport, RtcPeerFactory, SyntheticDevices};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Signed-in user id
    #[arg(short, long, env = "QUADCALL_USER", default_value = "alice")]
    user: String,

    /// Path to a TOML config file
    #[arg(short, long, env = "QUADCALL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a loopback call between two local users
    Demo {
        /// Peer to call
        #[arg(long, default_value = "bob")]
        peer: String,

        /// Make it a video call
        #[arg(long)]
        video: bool,

        /// Seconds to stay connected
        #[arg(long, default_value_t = 3)]
        seconds: u64,
    },

    /// Print the effective configuration
    Config,

    /// Show status and available commands
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("quadcall=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Demo {
            peer,
            video,
            seconds,
        } => {
            let kind = if video {
                MediaKind::Video
            } else {
                MediaKind::Audio
            };
            handle_demo(&cli.user, &peer, kind, Duration::from_secs(seconds), config).await?;
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Status => {
            handle_status(&cli.user, &config);
        }
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<CallConfig> {
    let config = match path {
        Some(path) => CallConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => CallConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

async fn handle_demo(
    user: &str,
    peer: &str,
    kind: MediaKind,
    connected_for: Duration,
    config: CallConfig,
) -> Result<()> {
    println!("📞 Loopback {:?} call: {} → {}", kind, user, peer);

    let transport = Arc::new(MemoryTransport::new());
    let caller = start_manager(user, &transport, config.clone()).await?;
    let callee = start_manager(peer, &transport, config).await?;
    println!("✅ Call managers started");

    let caller_log = tokio::spawn(print_events(user.to_string(), caller.subscribe_events()));
    let callee_log = tokio::spawn(print_events(peer.to_string(), callee.subscribe_events()));

    // Callee answers as soon as it rings.
    let answering = callee.clone();
    let answer = tokio::spawn(async move {
        answering
            .wait_for(|s| s.state == CallState::Incoming)
            .await?;
        answering.answer_call().await
    });

    let call_id = caller.start_call(UserId::new(peer), kind).await?;
    println!("📞 Ringing, call id {}", call_id);

    answer.await??;
    caller
        .wait_for_state(CallState::Connected, Duration::from_secs(10))
        .await?;
    println!("✅ Connected");

    let muted = caller.toggle_mute().await?;
    println!("🎙️  Muted: {}", muted);
    caller.toggle_mute().await?;

    if kind.has_video() {
        match caller.switch_camera().await? {
            CameraSwitch::Switched(facing) => println!("📷 Switched to {:?} camera", facing),
            CameraSwitch::SingleCamera => println!("📷 Only one camera available"),
        }
    }
    let speaker = caller.toggle_speaker().await?;
    println!("🔊 Speaker: {} ({:?})", speaker.on, speaker.route);

    tokio::time::sleep(connected_for).await;

    caller.end_call().await?;
    callee
        .wait_for_state(CallState::Idle, Duration::from_secs(10))
        .await?;
    println!("📞 Call ended");

    caller.shutdown().await?;
    callee.shutdown().await?;
    caller_log.abort();
    callee_log.abort();
    Ok(())
}

async fn start_manager(
    user: &str,
    transport: &Arc<MemoryTransport>,
    config: CallConfig,
) -> Result<CallManager> {
    let signaling = Arc::new(SignalingHandler::new(Arc::clone(transport)));
    let manager = CallManager::builder(UserId::new(user), signaling)
        .with_config(config)
        .with_devices(Arc::new(SyntheticDevices::new()))
        .with_peer_factory(Arc::new(RtcPeerFactory::new()))
        .build()
        .await?;
    Ok(manager)
}

async fn print_events(label: String, mut events: broadcast::Receiver<CallEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => println!("   [{}] {}", label, describe_event(&event)),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "Event stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn describe_event(event: &CallEvent) -> String {
    match event {
        CallEvent::StateChanged { from, to } => format!("{:?} → {:?}", from, to),
        CallEvent::IncomingCall { caller, kind, .. } => {
            format!("incoming {:?} call from {}", kind, caller)
        }
        CallEvent::BusyDeclined { caller, .. } => format!("busy, declined {}", caller),
        CallEvent::Connected { call_id } => format!("connected ({})", call_id),
        CallEvent::RemoteTrackAdded { kind, .. } => format!("remote {:?} track", kind),
        CallEvent::CallEnded { reason, .. } => format!("ended: {:?}", reason),
        CallEvent::CallFailed { error, .. } => format!("failed: {}", error),
        CallEvent::Notice(notice) => format!("notice: {:?}", notice),
    }
}

fn handle_status(user: &str, config: &CallConfig) {
    println!("📊 Quadcall Status");
    println!("==================");
    println!("👤 User: {}", user);
    println!("🧊 ICE servers: {}", config.ice_servers.len());
    match config.ring_timeout() {
        Some(timeout) => println!("⏱️  Ring timeout: {}s", timeout.as_secs()),
        None => println!("⏱️  Ring timeout: disabled"),
    }
    println!("🕑 Ended display: {}ms", config.ended_display_ms);
    println!(
        "📵 Busy handling: {}",
        if config.decline_when_busy {
            "decline"
        } else {
            "ignore"
        }
    );
    println!();
    println!("Available commands:");
    println!("  quadcall demo [--video]  - Loopback call between two local users");
    println!("  quadcall config          - Print the effective configuration");
    println!("  quadcall status          - Show this status");
}
