//! Event types broadcast by a live session.
//!
//! ## Channels
//!
//! | Event | Subscribe with |
//! |-------|----------------|
//! | `SessionStatusEvent` | `LiveClient::subscribe_status` |
//! | `TranscriptEvent` | `LiveClient::subscribe_transcript` |
//! | `ActivityEvent` | `LiveClient::subscribe_activity` |
//! | `SendResultEvent` | `LiveClient::subscribe_sends` |
//!
//! Everything serialises camelCase with lowercase enum tags so a host can
//! forward events as JSON unchanged.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Session status
// ---------------------------------------------------------------------------

/// Lifecycle of the live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Disconnected,
    /// Devices are opening and the handshake is in flight.
    Connecting,
    Connected,
    /// Failed; everything has been released. `connect` may be retried.
    Error,
}

impl SessionStatus {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

/// Emitted whenever the status changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusEvent {
    pub status: SessionStatus,
    /// Human-readable detail, e.g. the error message.
    pub detail: Option<String>,
}

// ---------------------------------------------------------------------------
// Transcript line
// ---------------------------------------------------------------------------

/// The on-screen transcript line changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEvent {
    pub seq: u64,
    /// New line, or `None` when the line was cleared.
    pub text: Option<String>,
}

// ---------------------------------------------------------------------------
// Microphone activity
// ---------------------------------------------------------------------------

/// Emitted for every analysed capture window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    pub seq: u64,
    /// Root-mean-square level of the window.
    pub rms: f32,
    pub is_speech: bool,
}

// ---------------------------------------------------------------------------
// Outbound media
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Image,
}

/// What became of one outbound payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SendOutcome {
    Sent,
    /// The outbound queue was full; the payload was discarded.
    Dropped,
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResultEvent {
    pub seq: u64,
    pub kind: MediaKind,
    pub outcome: SendOutcome,
}

// ---------------------------------------------------------------------------
// Feedback snapshot
// ---------------------------------------------------------------------------

/// Everything the visualizer and status line need for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackState {
    pub status: SessionStatus,
    pub model_speaking: bool,
    pub user_speaking: bool,
    pub muted: bool,
    pub camera_active: bool,
}

impl FeedbackState {
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_event_serializes_lowercase() {
        let event = SessionStatusEvent {
            status: SessionStatus::Connecting,
            detail: None,
        };
        let json = serde_json::to_value(&event).expect("serialize status event");
        assert_eq!(json["status"], "connecting");
        assert!(json["detail"].is_null());
    }

    #[test]
    fn send_outcome_is_tagged() {
        let event = SendResultEvent {
            seq: 4,
            kind: MediaKind::Image,
            outcome: SendOutcome::Failed {
                error: "socket closed".into(),
            },
        };
        let json = serde_json::to_value(&event).expect("serialize send result");
        assert_eq!(json["kind"], "image");
        assert_eq!(json["outcome"]["type"], "failed");
        assert_eq!(json["outcome"]["error"], "socket closed");

        let back: SendResultEvent = serde_json::from_value(json).expect("deserialize");
        assert!(matches!(back.outcome, SendOutcome::Failed { .. }));
    }

    #[test]
    fn activity_event_uses_camel_case() {
        let json = serde_json::to_value(ActivityEvent {
            seq: 1,
            rms: 0.05,
            is_speech: true,
        })
        .expect("serialize activity");
        assert_eq!(json["isSpeech"], true);
    }

    #[test]
    fn feedback_state_is_active_only_when_connected() {
        let mut state = FeedbackState::default();
        assert!(!state.is_active());
        state.status = SessionStatus::Connected;
        assert!(state.is_active());
        let json = serde_json::to_value(state).expect("serialize feedback");
        assert_eq!(json["modelSpeaking"], false);
        assert_eq!(json["cameraActive"], false);
    }

    #[test]
    fn media_kind_rejects_other_casing() {
        assert!(serde_json::from_str::<MediaKind>(r#""Audio""#).is_err());
    }
}
