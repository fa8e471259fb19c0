//! Parley terminal host.
//!
//! ## Runtime note
//!
//! One multi-threaded Tokio runtime hosts the session driver, the console
//! redraw loop and the stdin reader. Capture and snapshot loops run on the
//! runtime's blocking pool; the speaker stream owns a dedicated thread.

mod commands;
mod console;
mod settings;
mod state;

use std::path::PathBuf;
use std::sync::{atomic::Ordering, Arc};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use parley_core::{
    audio::device::{list_input_devices, list_output_devices, DeviceInfo},
    GeminiTransport, LiveClient, SendOutcome, SystemDevices,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast::error::RecvError, watch};
use tracing::{info, warn};

use commands::{execute, Command, Outcome, HELP};
use settings::{default_settings_path, load_settings};
use state::AppState;

/// Talk to a live voice model from the terminal.
#[derive(Parser)]
#[command(name = "parley", version, about)]
struct Cli {
    /// Settings file (default: platform data dir).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// API key for the live service.
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    voice: Option<String>,

    /// Input device name, as shown by --list-devices.
    #[arg(long)]
    input_device: Option<String>,

    /// Play a WAV file in place of the microphone.
    #[arg(long)]
    mic_wav: Option<PathBuf>,

    /// Use an image file as the camera.
    #[arg(long)]
    camera_image: Option<PathBuf>,

    /// Start with the microphone muted.
    #[arg(long)]
    muted: bool,

    /// Print audio devices and exit.
    #[arg(long)]
    list_devices: bool,

    /// Wait for `s` instead of starting a conversation right away.
    #[arg(long)]
    no_autostart: bool,
}

fn print_devices(title: &str, devices: &[DeviceInfo]) {
    println!("{title}:");
    if devices.is_empty() {
        println!("  (none)");
    }
    for d in devices {
        let marker = if d.is_default { " (default)" } else { "" };
        println!("  {}{marker}", d.name);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("parley=info,parley_core=info")
            }),
        )
        .init();

    if cli.list_devices {
        print_devices("input devices", &list_input_devices());
        print_devices("output devices", &list_output_devices());
        return Ok(());
    }

    // ── Settings ──────────────────────────────────────────────────────────
    let settings_path = cli.settings.clone().unwrap_or_else(default_settings_path);
    let mut app_settings = load_settings(&settings_path);
    if let Some(model) = &cli.model {
        app_settings.model = model.clone();
    }
    if let Some(voice) = &cli.voice {
        app_settings.voice_name = voice.clone();
    }
    if let Some(device) = &cli.input_device {
        app_settings.preferred_input_device = Some(device.clone());
    }
    if cli.muted {
        app_settings.start_muted = true;
    }
    app_settings.normalize();
    info!(
        settings_path = ?settings_path,
        model = %app_settings.model,
        voice = %app_settings.voice_name,
        interrupt_policy = %app_settings.interrupt_policy,
        "settings loaded"
    );

    let api_key = cli
        .api_key
        .clone()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .or_else(|| app_settings.api_key.clone())
        .with_context(|| {
            format!(
                "no API key: set GEMINI_API_KEY, pass --api-key, or add \"apiKey\" to {}",
                settings_path.display()
            )
        })?;

    // ── Session ───────────────────────────────────────────────────────────
    let transport = Arc::new(GeminiTransport::new(api_key));
    let devices = Arc::new(SystemDevices {
        mic_wav: cli.mic_wav.clone(),
        camera_image: cli.camera_image.clone(),
    });
    let client = LiveClient::new(app_settings.session_config(), transport, devices);
    client.set_muted(app_settings.start_muted);
    let color = app_settings.color;
    let state = Arc::new(AppState::new(client.clone(), app_settings, settings_path));

    let mut status_rx = client.subscribe_status();
    tokio::spawn(async move {
        loop {
            match status_rx.recv().await {
                Ok(event) => match &event.detail {
                    Some(detail) => info!(status = ?event.status, detail = %detail, "session status"),
                    None => info!(status = ?event.status, "session status"),
                },
                Err(RecvError::Lagged(n)) => warn!("status receiver lagged by {n} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut sends_rx = client.subscribe_sends();
    let send_failures = Arc::clone(&state.send_failures);
    tokio::spawn(async move {
        loop {
            match sends_rx.recv().await {
                Ok(event) => match event.outcome {
                    SendOutcome::Failed { error } => {
                        send_failures.fetch_add(1, Ordering::Relaxed);
                        warn!(seq = event.seq, kind = ?event.kind, "send failed: {error}");
                    }
                    SendOutcome::Dropped => {
                        tracing::debug!(seq = event.seq, kind = ?event.kind, "send dropped")
                    }
                    SendOutcome::Sent => {}
                },
                Err(RecvError::Lagged(n)) => tracing::debug!("send receiver lagged by {n} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut transcript_rx = client.subscribe_transcript();
    tokio::spawn(async move {
        loop {
            match transcript_rx.recv().await {
                Ok(event) => tracing::debug!(seq = event.seq, text = ?event.text, "transcript"),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let renderer = tokio::spawn(console::run(
        client.clone(),
        console::Console::new(color),
        shutdown_rx,
    ));

    eprintln!("{HELP}");
    if !cli.no_autostart {
        execute(&state, Command::Start)?;
    }

    // ── Input loop ────────────────────────────────────────────────────────
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("stdin closed");
                    break;
                };
                let Some(command) = Command::parse(&line) else {
                    if !line.trim().is_empty() {
                        eprintln!("{HELP}");
                    }
                    continue;
                };
                if execute(&state, command)? == Outcome::Quit {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    client.disconnect();
    let _ = shutdown_tx.send(true);
    let _ = renderer.await;
    // Let the close frame go out.
    tokio::time::sleep(Duration::from_millis(150)).await;
    info!(diagnostics = ?state.diagnostics_snapshot(), "Parley exiting");
    Ok(())
}
