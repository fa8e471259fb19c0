//! Console command handlers.
//!
//! Each stdin line is parsed into a `Command` and run against the shared
//! `AppState`. Handlers never fail the app for session-level problems: the
//! core already moved the session to `Error` and put a line on screen.

use std::sync::{atomic::Ordering, Arc};

use parley_core::{ParleyError, SessionStatus};
use tracing::{info, warn};

use crate::settings::update_settings;
use crate::state::AppState;

pub const HELP: &str = "commands: s start | x end | m mute | c camera | d diagnostics | p settings | h help | q quit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    End,
    ToggleMute,
    ToggleCamera,
    Diagnostics,
    Settings,
    Help,
    Quit,
}

impl Command {
    /// Parse one input line. Blank lines parse to `None`; so do unknown words.
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim().to_ascii_lowercase().as_str() {
            "s" | "start" => Some(Self::Start),
            "x" | "end" | "stop" => Some(Self::End),
            "m" | "mute" => Some(Self::ToggleMute),
            "c" | "camera" => Some(Self::ToggleCamera),
            "d" | "diag" | "diagnostics" => Some(Self::Diagnostics),
            "p" | "settings" => Some(Self::Settings),
            "h" | "?" | "help" => Some(Self::Help),
            "q" | "quit" | "exit" => Some(Self::Quit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    Quit,
}

/// Start a conversation in the background. Returns `false` when a start is
/// already in flight.
pub fn start_conversation(state: &Arc<AppState>) -> bool {
    if state
        .connect_inflight
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        state.commands_dropped.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("start dropped due to in-flight connect");
        return false;
    }
    let client = state.client.clone();
    let inflight = Arc::clone(&state.connect_inflight);
    tokio::spawn(async move {
        match client.connect().await {
            Ok(()) => {}
            Err(ParleyError::AlreadyConnected) => info!("conversation already running"),
            Err(ParleyError::ConnectAborted) => info!("start cancelled"),
            Err(e) => warn!("start failed: {e}"),
        }
        inflight.store(false, Ordering::SeqCst);
    });
    true
}

pub fn execute(state: &Arc<AppState>, command: Command) -> anyhow::Result<Outcome> {
    state.commands_executed.fetch_add(1, Ordering::Relaxed);
    let client = &state.client;
    match command {
        Command::Start => {
            start_conversation(state);
        }
        Command::End => client.disconnect(),
        Command::ToggleMute => {
            let muted = !client.feedback().muted;
            client.set_muted(muted);
            state.settings.lock().start_muted = muted;
            if let Err(e) = update_settings(&state.settings_path, |s| s.start_muted = muted) {
                warn!("failed to persist mute preference: {e}");
            }
        }
        Command::ToggleCamera => {
            if client.feedback().camera_active {
                client.stop_camera();
            } else {
                match client.start_camera() {
                    Ok(()) => {}
                    Err(ParleyError::NotConnected) => {
                        info!("camera needs a live conversation; press s first")
                    }
                    Err(e) => warn!("camera unavailable: {e}"),
                }
            }
        }
        Command::Diagnostics => {
            let diag = state.diagnostics_snapshot();
            println!("\n{}", serde_json::to_string_pretty(&diag)?);
        }
        Command::Settings => {
            let runtime = state.settings.lock().runtime_settings();
            println!("\n{}", serde_json::to_string_pretty(&runtime)?);
        }
        Command::Help => println!("\n{HELP}"),
        Command::Quit => {
            if client.status() != SessionStatus::Disconnected {
                client.disconnect();
            }
            return Ok(Outcome::Quit);
        }
    }
    Ok(Outcome::Continue)
}
