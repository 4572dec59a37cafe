use anyhow::{Context, Result};
use chatify_rust::calls::loopback::{LoopbackDevices, LoopbackPeerFactory, RecordingSink};
use chatify_rust::calls::{CallManager, CallManagerConfig, InMemoryRelay, ManagerEvent};
use chatify_rust::phase::NegotiationPhase;
use chatify_rust::types::{CallMode, UserId};
use chrono::Local;
use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

// Runs a complete call between two users living in this process, over the
// in-memory relay and loopback media.
//
// Usage:
//   cargo run                                  # video call alice -> bob
//   cargo run -- --mode voice --hold-secs 5    # longer audio call
//   cargo run -- --decline                     # callee declines
//   cargo run -- --config calls.json           # CallManagerConfig as JSON

#[derive(Parser)]
#[command(name = "chatify-call")]
#[command(about = "Run a loopback call between two in-process users")]
struct Cli {
    #[arg(long, default_value = "alice")]
    caller: String,

    #[arg(long, default_value = "bob")]
    callee: String,

    /// `voice` or `video`
    #[arg(short, long, default_value = "video", value_parser = parse_mode)]
    mode: CallMode,

    /// How long to stay connected before hanging up.
    #[arg(long, default_value_t = 3)]
    hold_secs: u64,

    /// Have the callee decline instead of answering.
    #[arg(long)]
    decline: bool,

    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn parse_mode(s: &str) -> Result<CallMode, String> {
    CallMode::from_str_opt(s).ok_or_else(|| format!("unknown call mode '{s}'"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(async {
        if let Err(e) = run(cli).await {
            error!("Demo failed: {:#}", e);
            return Err(e);
        }
        Ok(())
    })
}

fn user(
    id: &str,
    config: &CallManagerConfig,
    relay: Arc<InMemoryRelay>,
    transports: Arc<LoopbackPeerFactory>,
) -> Arc<CallManager> {
    CallManager::new(
        UserId::new(id),
        config.clone(),
        relay,
        Arc::new(LoopbackDevices::new()),
        Arc::new(RecordingSink::new()),
        transports,
    )
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => {
            let json = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            CallManagerConfig::from_json(&json)?
        }
        None => CallManagerConfig::default(),
    };

    let relay = Arc::new(InMemoryRelay::new());
    let transports = Arc::new(LoopbackPeerFactory::new());
    let caller = user(&cli.caller, &config, relay.clone(), transports.clone());
    let callee = user(&cli.callee, &config, relay.clone(), transports);
    caller.start_listening().await?;
    callee.start_listening().await?;

    // The callee answers (or declines) whatever rings.
    let answering = callee.clone();
    let decline = cli.decline;
    let mut incoming = callee.events().receiver();
    let answerer = tokio::spawn(async move {
        loop {
            match incoming.recv().await {
                Ok(ManagerEvent::IncomingCall(call)) => {
                    info!("{} is calling ({})", call.from, call.mode);
                    let result = if decline {
                        answering.decline(&call.from).await.map(|_| None)
                    } else {
                        answering.accept(&call.from).await.map(Some)
                    };
                    return result;
                }
                Ok(other) => info!("Callee event: {:?}", other),
                Err(RecvError::Lagged(n)) => warn!("Callee missed {} events", n),
                Err(RecvError::Closed) => return Ok(None),
            }
        }
    });

    let session = caller
        .start_call(UserId::new(cli.callee.as_str()), cli.mode)
        .await?;
    let answered = answerer.await?;
    let remote_session = answered?;

    let mut watch = session.watch();
    let reached = tokio::time::timeout(Duration::from_secs(10), async move {
        watch
            .wait_for(|s| s.phase == NegotiationPhase::Connected || s.phase.is_terminal())
            .await
            .map(|s| s.phase)
    })
    .await;
    match reached {
        Ok(Ok(phase)) if phase == NegotiationPhase::Connected => {
            info!("Call is up: {}", phase.status_label());
        }
        Ok(_) => {
            let outcome = session.wait_ended().await;
            info!("Call did not connect: {}", outcome.reason.notice());
            return Ok(());
        }
        Err(_) => warn!("Gave up waiting for the call to connect"),
    }

    let muted = !session.toggle_audio().await?;
    info!("Caller microphone muted: {}", muted);
    session.minimize().await?;
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(cli.hold_secs)) => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted, hanging up"),
    }
    info!("Duration so far: {}", session.snapshot().duration_label());

    let outcome = session.end().await;
    info!(
        "Caller: {} ({:?}, connected: {})",
        outcome.reason.notice(),
        outcome.duration,
        outcome.was_connected
    );
    if let Some(remote) = remote_session {
        let outcome = remote.wait_ended().await;
        info!("Callee: {}", outcome.reason.notice());
    }
    info!("{} signaling rows were published", relay.published().len());
    Ok(())
}
