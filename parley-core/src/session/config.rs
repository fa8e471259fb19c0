use std::time::Duration;

use crate::playback::{InterruptPolicy, SPEAKING_EPSILON_SECS};
use crate::session::transport::SessionSetup;
use crate::vad::energy::DEFAULT_THRESHOLD;

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-12-2025";
pub const DEFAULT_VOICE: &str = "Puck";
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a warm, attentive conversation partner. \
Keep replies short and natural, the way people talk out loud. If the user shares their camera, \
you can comment on what you see when it helps the conversation.";

/// Configuration for `LiveClient`.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub model: String,
    pub system_instruction: String,
    pub voice_name: String,
    /// Rate of outbound microphone audio (Hz). Default: 16000.
    pub input_sample_rate: u32,
    /// Rate assumed for inbound speech whose MIME type carries no rate, and
    /// the rate requested from the output device. Default: 24000.
    pub output_sample_rate: u32,
    /// Samples per outbound audio window. Default: 4096.
    pub window_size: usize,
    /// RMS a window must exceed to count as speech. Default: 0.02.
    pub vad_threshold: f32,
    /// Quiet windows still reported as speech after speech ends. Default: 0.
    pub vad_hangover_windows: u32,
    /// Camera snapshot cadence. Default: 600 ms.
    pub frame_interval: Duration,
    /// Requested camera resolution. Default: 1920×1080.
    pub camera_width: u32,
    pub camera_height: u32,
    /// JPEG quality, 1..=100. Default: 80.
    pub jpeg_quality: u8,
    /// How long a user transcript line stays visible. Default: 5 s.
    pub transcript_clear_after: Duration,
    /// Tolerance of the end-of-speech heuristic. Default: 0.1 s.
    pub speaking_epsilon_secs: f64,
    /// Outbound payloads buffered before new ones are dropped. Default: 64.
    pub outbound_capacity: usize,
    pub interrupt_policy: InterruptPolicy,
    /// Preferred input device name; `None` uses the system default.
    pub preferred_input_device: Option<String>,
    /// Ask the service to transcribe the user's speech. Default: true.
    pub input_transcription: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.into(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.into(),
            voice_name: DEFAULT_VOICE.into(),
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            window_size: 4_096,
            vad_threshold: DEFAULT_THRESHOLD,
            vad_hangover_windows: 0,
            frame_interval: Duration::from_millis(600),
            camera_width: 1_920,
            camera_height: 1_080,
            jpeg_quality: 80,
            transcript_clear_after: Duration::from_secs(5),
            speaking_epsilon_secs: SPEAKING_EPSILON_SECS,
            outbound_capacity: 64,
            interrupt_policy: InterruptPolicy::default(),
            preferred_input_device: None,
            input_transcription: true,
        }
    }
}

impl SessionConfig {
    pub fn setup(&self) -> SessionSetup {
        SessionSetup {
            model: self.model.clone(),
            voice_name: self.voice_name.clone(),
            system_instruction: self.system_instruction.clone(),
            input_transcription: self.input_transcription,
        }
    }
}
