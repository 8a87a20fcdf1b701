//! Voxlink CLI Application

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use console::ConsolePresenter;
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;
use voxlink_core::loopback::{LoopbackPeerFactory, MemoryRelay, SyntheticCapture};
use voxlink_core::media::{acquire_audio, release};
use voxlink_core::peer::PeerConnectionHandle;
use voxlink_core::prelude::*;
use voxlink_core::{
    IceConnectionState, PeerEvent, PeerEventSender, SampleAudioCapture, WebRtcPeerFactory,
};

mod console;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Identity used on the signaling relay
    #[arg(short, long, env = "VOXLINK_IDENTITY")]
    identity: Option<String>,

    /// JSON configuration file
    #[arg(short, long, env = "VOXLINK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a call between two in-process peers
    Demo {
        /// Seconds to stay in the call
        #[arg(long, default_value_t = 5)]
        duration: u64,

        /// Fault to inject once the call is up
        #[arg(long, value_enum)]
        fault: Option<Fault>,
    },

    /// Create a real peer connection and print its offer
    Offer,

    /// Print the effective configuration
    Config,

    /// Show status and available commands
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Fault {
    /// ICE fails on the caller's connection
    Network,
    /// The caller's microphone track ends
    Microphone,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("voxlink=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Demo { duration, fault } => {
            let identity = cli.identity.unwrap_or_else(generate_identity);
            println!("🔗 Using identity: {identity}");
            handle_demo(&identity, config, Duration::from_secs(duration), fault).await?;
        }
        Commands::Offer => {
            handle_offer(config).await?;
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Status => {
            handle_status(&config);
        }
    }

    Ok(())
}

/// Default configuration, or the validated contents of `path`
fn load_config(path: Option<&Path>) -> Result<CallManagerConfig> {
    let Some(path) = path else {
        return Ok(CallManagerConfig::default());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config = CallManagerConfig::from_json(&json)
        .with_context(|| format!("loading config file {}", path.display()))?;
    tracing::info!(path = %path.display(), "Configuration loaded");
    Ok(config)
}

async fn handle_demo(
    identity: &str,
    config: CallManagerConfig,
    duration: Duration,
    fault: Option<Fault>,
) -> Result<()> {
    let relay = MemoryRelay::new();

    let caller_factory = Arc::new(LoopbackPeerFactory::new());
    let caller_capture = Arc::new(SyntheticCapture::new());
    let caller = CallServiceBuilder::new(Arc::new(relay.connect(identity)))
        .with_config(config.clone())
        .with_peer_factory(caller_factory.clone())
        .with_capture(caller_capture.clone())
        .with_presenter(Arc::new(ConsolePresenter::new(identity)))
        .with_local_profile(PeerProfile::named(identity))
        .build()
        .await?;

    let callee_id = PeerIdentityString::new("demo-callee");
    let callee = CallServiceBuilder::new(Arc::new(relay.connect(callee_id.clone())))
        .with_config(config)
        .with_peer_factory(Arc::new(LoopbackPeerFactory::new()))
        .with_capture(Arc::new(SyntheticCapture::new()))
        .with_presenter(Arc::new(ConsolePresenter::new(callee_id.as_str())))
        .with_local_profile(PeerProfile::named("Demo callee"))
        .build()
        .await?;

    let mut callee_events = callee.subscribe_events();
    let answering = callee.clone();
    let auto_answer = tokio::spawn(async move {
        loop {
            match callee_events.recv().await {
                Ok(CallEvent::IncomingCall { .. }) => {
                    if let Err(e) = answering.accept_call().await {
                        tracing::warn!(error = %e, "Auto-answer failed");
                    }
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut events = caller.subscribe_events();
    println!("📞 Calling {callee_id}...");
    caller
        .initiate_call(callee_id, PeerProfile::named("Demo callee"))
        .await?;

    let connected = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(CallEvent::StateChanged {
                    state: CallState::Active,
                    ..
                }) => return true,
                Ok(CallEvent::CallEnded { .. }) | Err(RecvError::Closed) => return false,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
            }
        }
    })
    .await
    .unwrap_or(false);
    if !connected {
        anyhow::bail!("demo call did not connect");
    }

    match fault {
        Some(Fault::Network) => {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if let Some(peer) = caller_factory.last_peer() {
                println!("💥 Failing the caller's ICE connection");
                peer.simulate_ice_state(IceConnectionState::Failed);
            }
        }
        Some(Fault::Microphone) => {
            tokio::time::sleep(Duration::from_secs(1)).await;
            println!("💥 Unplugging the caller's microphone");
            for track in caller_capture.last_tracks() {
                track.end();
            }
        }
        None => {}
    }

    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Ok(CallEvent::CallEnded { reason, .. }) => {
                    println!("Call ended: {reason:?}");
                    break;
                }
                Ok(event) => {
                    if let Some(text) = describe(&event) {
                        println!("{text}");
                    }
                }
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    }

    caller.end_call().await?;
    caller.shutdown().await;
    callee.shutdown().await;
    auto_answer.abort();

    println!();
    println!("📊 {} signaling messages relayed", relay.log().len());
    Ok(())
}

/// One-line summary of the recovery and connectivity events
fn describe(event: &CallEvent<PeerIdentityString>) -> Option<String> {
    match event {
        CallEvent::NetworkPathDetected { path, .. } => Some(format!("🌐 Media path: {path}")),
        CallEvent::Reconnecting {
            attempt,
            max_attempts,
            ..
        } => Some(format!("🔄 Reconnecting (attempt {attempt}/{max_attempts})")),
        CallEvent::TrackRecovered { .. } => Some("✅ Remote audio recovered".to_string()),
        CallEvent::LocalAudioRecaptured { renegotiated, .. } => Some(format!(
            "🎙️  Microphone re-captured{}",
            if *renegotiated { " and renegotiated" } else { "" }
        )),
        _ => None,
    }
}

async fn handle_offer(config: CallManagerConfig) -> Result<()> {
    let factory = WebRtcPeerFactory::new();
    let capture = SampleAudioCapture::new();
    let local = acquire_audio(&capture, &config.audio).await?;

    let (events, mut rx) = PeerEventSender::channel();
    let mut handle =
        PeerConnectionHandle::open(&factory, &config.ice, CallId::new(), Some(&local), events)
            .await?;
    let offer = handle.local_offer(false).await?;
    println!("{}", offer.sdp);

    let mut candidates = 0usize;
    let gathering = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = rx.recv().await {
            match event {
                PeerEvent::IceCandidate(Some(_)) => candidates += 1,
                PeerEvent::IceCandidate(None) => break,
                _ => {}
            }
        }
    })
    .await;
    if gathering.is_err() {
        tracing::warn!("Candidate gathering did not finish in time");
    }
    eprintln!("{candidates} local candidate(s) gathered");

    handle.close().await;
    release(&local);
    Ok(())
}

fn handle_status(config: &CallManagerConfig) {
    println!("📊 Voxlink CLI Status");
    println!("====================");
    println!("Version:            {}", env!("CARGO_PKG_VERSION"));
    println!("Peer backend:       webrtc");
    println!("ICE servers:        {}", config.ice.servers.len());
    println!(
        "Answer timeout:     {}s",
        config.answer_timeout.as_secs()
    );
    println!(
        "Reconnect attempts: {}",
        config.recovery.max_reconnect_attempts
    );
    println!();
    println!("Available commands:");
    println!("  voxlink demo [--fault network|microphone]  - Run an in-process call");
    println!("  voxlink offer                              - Print a real offer SDP");
    println!("  voxlink config                             - Print the configuration");
    println!("  voxlink status                             - Show this status");
    println!();
    println!("Use 'voxlink --help' for detailed options");
}

fn generate_identity() -> String {
    const WORDS: &[&str] = &[
        "alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel", "india",
        "juliet", "kilo", "lima", "mike", "november", "oscar", "papa", "quebec", "romeo", "sierra",
        "tango", "uniform", "victor", "whiskey", "xray", "yankee", "zulu",
    ];

    let mut rng = rand::thread_rng();
    let first = WORDS[rng.gen_range(0..WORDS.len())];
    let second = WORDS[rng.gen_range(0..WORDS.len())];
    format!("{first}-{second}-{:04}", rng.gen_range(0..10_000))
}
