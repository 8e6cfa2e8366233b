//! Mic Relay terminal front end
//!
//! Relays the microphone (device or Bluetooth headset) to the speakers.
//! Reads commands from stdin: `device`, `bluetooth`, `stop`, `status`, `quit`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mic_relay::{
    audio::{device::list_devices, AudioSink, CpalSink, CpalSource, TeeSink, WavFileSink},
    bluetooth::{LinkNegotiator, PulseRouting, RoutingLayer},
    config::RelayConfig,
    relay::{Capabilities, RelayController, RelayEvent, SourceMode, StartAck},
};

#[derive(Parser)]
#[command(name = "mic-relay", version, about = "Relay a microphone to the speakers in real time")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay, reading commands from stdin
    Run {
        /// Start a session right away in this mode (device or bluetooth)
        #[arg(short, long)]
        mode: Option<SourceMode>,

        /// Also record the relayed audio to this WAV file
        #[arg(short, long)]
        record: Option<PathBuf>,

        /// Record only, without playing back to the speakers
        #[arg(long, requires = "record")]
        no_playback: bool,

        /// Config file (defaults to the platform config directory)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// List audio devices
    Devices,
    /// Write the default configuration file
    InitConfig {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Devices => {
            print_devices();
            Ok(())
        }
        Command::InitConfig { config } => {
            let path = config.unwrap_or_else(RelayConfig::default_path);
            RelayConfig::default().save(&path)?;
            println!("Wrote {}", path.display());
            Ok(())
        }
        Command::Run {
            mode,
            record,
            no_playback,
            config,
            json,
        } => run(mode, record, no_playback, config, json).await,
    }
}

fn print_devices() {
    println!("\n=== Available Audio Devices ===");
    for device in list_devices() {
        let device_type = match (device.is_input, device.is_output) {
            (true, true) => "Input/Output",
            (true, false) => "Input",
            (false, true) => "Output",
            _ => "Unknown",
        };
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {} ({}){}:", device.name, device_type, default_marker);
        println!("    ID: {}", device.id);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();
}

fn render(event: &RelayEvent, json: bool) {
    if json {
        if let Ok(line) = serde_json::to_string(event) {
            println!("{}", line);
        }
        return;
    }
    match event {
        RelayEvent::StateChanged { .. } => {}
        RelayEvent::BluetoothUnsupported => {
            println!("Bluetooth headset audio is not supported here")
        }
        RelayEvent::Negotiating => println!("Connecting to Bluetooth headset..."),
        RelayEvent::LinkConnected => println!("Bluetooth headset connected"),
        RelayEvent::NegotiationFailed { reason } => {
            println!("Bluetooth connection failed: {}", reason)
        }
        RelayEvent::Streaming { mode } => println!("Relaying from {} microphone", mode),
        RelayEvent::Stopped => println!("Stopped"),
        RelayEvent::Error { code, message } => println!("Error [{}]: {}", code, message),
    }
}

fn build_sink(
    config: &RelayConfig,
    record: Option<PathBuf>,
    no_playback: bool,
) -> Box<dyn AudioSink> {
    let speakers = CpalSink::new(
        config.devices.playback.clone(),
        config.audio.playback_queue_chunks,
    );
    match record {
        Some(path) if no_playback => Box::new(WavFileSink::to_path(path)),
        Some(path) => Box::new(TeeSink::new(speakers, WavFileSink::to_path(path))),
        None => Box::new(speakers),
    }
}

async fn run(
    mode: Option<SourceMode>,
    record: Option<PathBuf>,
    no_playback: bool,
    config_path: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let config_path = config_path.unwrap_or_else(RelayConfig::default_path);
    let config = RelayConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let (format, chunk_size) = config.audio.session_format()?;
    let record = record.or_else(|| config.recording.path.clone());

    if !PulseRouting::is_available() {
        tracing::warn!("pactl not found, Bluetooth mode will be unavailable");
    }
    let routing: Arc<dyn RoutingLayer> = Arc::new(PulseRouting::new(config.bluetooth.clone()));
    let negotiator = LinkNegotiator::new(routing, config.bluetooth.negotiation_timeout());

    let controller = RelayController::builder(
        Box::new(CpalSource::new(config.devices.capture.clone())),
        build_sink(&config, record, no_playback),
        negotiator,
    )
    .format(format, chunk_size)
    .capabilities(Capabilities::from_host())
    .on_event(move |event| render(&event, json))
    .build()?;
    let controller = Arc::new(controller);

    tracing::info!("Mic relay ready ({}, {} byte chunks)", format, chunk_size);
    if let Some(mode) = mode {
        start(&controller, mode).await;
    }

    let mut lines = stdin_lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
            line = lines.recv() => {
                let Some(line) = line else { break };
                match line.trim() {
                    "" => {}
                    "device" | "start" => start(&controller, SourceMode::Device).await,
                    "bluetooth" | "bt" => start(&controller, SourceMode::Bluetooth).await,
                    "stop" => stop(&controller).await?,
                    "status" => status(&controller, json),
                    "quit" | "exit" => break,
                    other => println!(
                        "Unknown command '{}' (device, bluetooth, stop, status, quit)",
                        other
                    ),
                }
            }
        }
    }

    stop(&controller).await
}

/// Stdin lines from a detached reader thread, so exit never waits on input
fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

async fn start(controller: &Arc<RelayController>, mode: SourceMode) {
    let c = controller.clone();
    match tokio::task::spawn_blocking(move || c.start(mode)).await {
        Ok(Ok(StartAck::Streaming)) => {}
        Ok(Ok(StartAck::Negotiating)) => tracing::debug!("Waiting for headset link"),
        // Already rendered through the event callback
        Ok(Err(e)) => tracing::debug!("Start failed: {}", e),
        Err(e) => tracing::error!("Start task failed: {}", e),
    }
}

async fn stop(controller: &Arc<RelayController>) -> Result<()> {
    let c = controller.clone();
    tokio::task::spawn_blocking(move || c.stop()).await??;
    Ok(())
}

fn status(controller: &RelayController, json: bool) {
    match controller.session() {
        Some(info) if json => {
            if let Ok(line) = serde_json::to_string(&info) {
                println!("{}", line);
            }
        }
        Some(info) => println!(
            "{} session {}: {} ({} Hz, {} ch, {} bit), {} chunks / {} bytes relayed",
            info.mode,
            info.id,
            info.state,
            info.sample_rate,
            info.channels,
            info.bits_per_sample,
            info.chunks_relayed,
            info.bytes_relayed
        ),
        None => println!("{}", controller.state()),
    }
}
