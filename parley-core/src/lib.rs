//! # parley-core
//!
//! Live voice (and optional vision) session engine.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → SPSC RingBuffer → capture loop (spawn_blocking)
//!                                   │  resample → 4096-sample windows → RMS/VAD
//!                                   ▼
//! Camera → snapshot loop ──► OutboundQueue ──► forwarder ──► LiveSession
//!                                                               │
//!                               driver task ◄── ServerEvent ◄───┘
//!                                   │  decode → PlaybackScheduler → OutputSink
//!                                   ▼
//!                   broadcast: status / transcript / activity / sends
//! ```
//!
//! Audio callbacks never allocate or block. All heap work happens on the
//! capture thread, the output thread or the async tasks.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod capture;
pub mod codec;
pub mod devices;
pub mod error;
pub mod ipc;
pub mod playback;
pub mod render;
pub mod session;
pub mod vad;

// Convenience re-exports for downstream crates
pub use devices::{MediaDevices, SystemDevices};
pub use error::{ParleyError, Result};
pub use ipc::events::{
    ActivityEvent, FeedbackState, MediaKind, SendOutcome, SendResultEvent, SessionStatus,
    SessionStatusEvent, TranscriptEvent,
};
pub use playback::{InterruptPolicy, OutputSink, PlaybackScheduler};
pub use session::{LiveClient, LiveSession, LiveTransport, SessionConfig};

#[cfg(feature = "gemini")]
pub use session::gemini::GeminiTransport;
