//! Persistent application settings (JSON file in the app data directory).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parley_core::{
    session::config::{DEFAULT_MODEL, DEFAULT_SYSTEM_INSTRUCTION, DEFAULT_VOICE},
    InterruptPolicy, SessionConfig,
};
use serde::{Deserialize, Serialize};

/// Voices the live service accepts.
pub const KNOWN_VOICES: &[&str] = &[
    "Puck", "Charon", "Kore", "Fenrir", "Aoede", "Leda", "Orus", "Zephyr",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    /// Prefer the `GEMINI_API_KEY` environment variable; this is a fallback.
    pub api_key: Option<String>,
    pub model: String,
    pub voice_name: String,
    pub system_instruction: String,
    pub preferred_input_device: Option<String>,
    pub interrupt_policy: String,
    pub vad_threshold: f32,
    pub vad_hangover_windows: u32,
    pub frame_interval_ms: u64,
    pub camera_width: u32,
    pub camera_height: u32,
    pub jpeg_quality: u8,
    pub transcript_clear_secs: f32,
    pub input_transcription: bool,
    pub start_muted: bool,
    pub color: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.into(),
            voice_name: DEFAULT_VOICE.into(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.into(),
            preferred_input_device: None,
            interrupt_policy: InterruptPolicy::default().as_str().into(),
            vad_threshold: 0.02,
            vad_hangover_windows: 0,
            frame_interval_ms: 600,
            camera_width: 1920,
            camera_height: 1080,
            jpeg_quality: 80,
            transcript_clear_secs: 5.0,
            input_transcription: true,
            start_muted: false,
            color: true,
        }
    }
}

/// What `config` prints: settings with the key reduced to a flag.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSettings {
    pub has_api_key: bool,
    pub model: String,
    pub voice_name: String,
    pub preferred_input_device: Option<String>,
    pub interrupt_policy: String,
    pub vad_threshold: f32,
    pub frame_interval_ms: u64,
    pub jpeg_quality: u8,
    pub transcript_clear_secs: f32,
    pub start_muted: bool,
}

impl AppSettings {
    pub fn normalize(&mut self) {
        let defaults = Self::default();
        self.api_key = trimmed(self.api_key.as_deref());
        self.model = normalize_model(&self.model);
        self.voice_name = normalize_voice(&self.voice_name);
        if self.system_instruction.trim().is_empty() {
            self.system_instruction = defaults.system_instruction;
        }
        self.preferred_input_device = trimmed(self.preferred_input_device.as_deref());
        self.interrupt_policy = InterruptPolicy::parse(&self.interrupt_policy)
            .unwrap_or_default()
            .as_str()
            .into();
        self.vad_threshold = if self.vad_threshold.is_finite() {
            self.vad_threshold.clamp(0.001, 0.5)
        } else {
            defaults.vad_threshold
        };
        self.vad_hangover_windows = self.vad_hangover_windows.min(16);
        self.frame_interval_ms = self.frame_interval_ms.clamp(100, 10_000);
        self.camera_width = self.camera_width.clamp(64, 3840);
        self.camera_height = self.camera_height.clamp(64, 2160);
        self.jpeg_quality = self.jpeg_quality.clamp(10, 100);
        self.transcript_clear_secs = if self.transcript_clear_secs.is_finite() {
            self.transcript_clear_secs.clamp(0.5, 60.0)
        } else {
            defaults.transcript_clear_secs
        };
    }

    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            has_api_key: self.api_key.is_some(),
            model: self.model.clone(),
            voice_name: self.voice_name.clone(),
            preferred_input_device: self.preferred_input_device.clone(),
            interrupt_policy: self.interrupt_policy.clone(),
            vad_threshold: self.vad_threshold,
            frame_interval_ms: self.frame_interval_ms,
            jpeg_quality: self.jpeg_quality,
            transcript_clear_secs: self.transcript_clear_secs,
            start_muted: self.start_muted,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            model: self.model.clone(),
            system_instruction: self.system_instruction.clone(),
            voice_name: self.voice_name.clone(),
            vad_threshold: self.vad_threshold,
            vad_hangover_windows: self.vad_hangover_windows,
            frame_interval: Duration::from_millis(self.frame_interval_ms),
            camera_width: self.camera_width,
            camera_height: self.camera_height,
            jpeg_quality: self.jpeg_quality,
            transcript_clear_after: Duration::from_secs_f32(self.transcript_clear_secs),
            interrupt_policy: InterruptPolicy::parse(&self.interrupt_policy).unwrap_or_default(),
            preferred_input_device: self.preferred_input_device.clone(),
            input_transcription: self.input_transcription,
            ..SessionConfig::default()
        }
    }
}

fn trimmed(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

pub fn normalize_model(raw: &str) -> String {
    let model = raw.trim();
    let model = model.strip_prefix("models/").unwrap_or(model);
    if model.is_empty() {
        DEFAULT_MODEL.into()
    } else {
        model.into()
    }
}

/// Match a known voice case-insensitively; unknown names fall back to the default.
pub fn normalize_voice(raw: &str) -> String {
    let wanted = raw.trim();
    KNOWN_VOICES
        .iter()
        .find(|v| v.eq_ignore_ascii_case(wanted))
        .copied()
        .unwrap_or(DEFAULT_VOICE)
        .into()
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Parley")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("parley")
            .join("settings.json")
    }
}

/// Load settings, falling back to defaults for a missing or unreadable file.
pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| match serde_json::from_str::<AppSettings>(&raw) {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::warn!(path = ?path, "ignoring malformed settings file: {e}");
                None
            }
        })
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

/// Read-modify-write the file, leaving fields the caller does not touch
/// (and any command-line overrides held in memory) alone.
pub fn update_settings(path: &Path, edit: impl FnOnce(&mut AppSettings)) -> std::io::Result<()> {
    let mut settings = load_settings(path);
    edit(&mut settings);
    settings.normalize();
    save_settings(path, &settings)
}
