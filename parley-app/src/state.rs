//! Shared application state, handed to every command handler.

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;
use parley_core::{session::DiagnosticsSnapshot, LiveClient, SessionStatus};
use serde::Serialize;

use crate::settings::AppSettings;

pub struct AppState {
    pub client: LiveClient,
    /// Effective settings: the file plus command-line overrides.
    pub settings: Arc<Mutex<AppSettings>>,
    /// Absolute path to `settings.json`.
    pub settings_path: PathBuf,
    /// Guard to prevent overlapping start requests.
    pub connect_inflight: Arc<AtomicBool>,
    /// Count of commands accepted for execution.
    pub commands_executed: AtomicUsize,
    /// Count of start requests dropped because one was already running.
    pub commands_dropped: AtomicUsize,
    /// Count of outbound payloads the remote side rejected.
    pub send_failures: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(client: LiveClient, settings: AppSettings, settings_path: PathBuf) -> Self {
        Self {
            client,
            settings: Arc::new(Mutex::new(settings)),
            settings_path,
            connect_inflight: Arc::new(AtomicBool::new(false)),
            commands_executed: AtomicUsize::new(0),
            commands_dropped: AtomicUsize::new(0),
            send_failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn diagnostics_snapshot(&self) -> AppDiagnostics {
        AppDiagnostics {
            status: self.client.status(),
            generation: self.client.generation(),
            commands_executed: self.commands_executed.load(Ordering::Relaxed),
            commands_dropped: self.commands_dropped.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            session: self.client.diagnostics(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppDiagnostics {
    pub status: SessionStatus,
    pub generation: u64,
    pub commands_executed: usize,
    pub commands_dropped: usize,
    pub send_failures: usize,
    #[serde(flatten)]
    pub session: DiagnosticsSnapshot,
}
