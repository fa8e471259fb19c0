use thiserror::Error;

use crate::codec::DecodeError;

/// All errors produced by parley-core.
#[derive(Debug, Error)]
pub enum ParleyError {
    #[error("{device} access denied: {reason}")]
    Permission { device: &'static str, reason: String },

    #[error("session handshake failed: {0}")]
    Handshake(String),

    #[error("malformed audio payload: {0}")]
    Decode(#[from] DecodeError),

    #[error("remote session error: {0}")]
    Remote(String),

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("no default output device found")]
    NoDefaultOutputDevice,

    #[error("camera error: {0}")]
    Camera(String),

    #[error("image encoding error: {0}")]
    ImageEncode(String),

    #[error("outbound queue is full, remote side cannot keep up")]
    OutboundQueueFull,

    #[error("session is not connected")]
    NotConnected,

    #[error("a session is already active")]
    AlreadyConnected,

    #[error("connect was superseded by a disconnect")]
    ConnectAborted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ParleyError {
    /// Classify a backend device failure.
    ///
    /// Host audio APIs report a denied microphone/camera grant as a generic
    /// device error, so the message text is the only signal available.
    pub fn from_device_failure(device: &'static str, message: impl Into<String>) -> Self {
        let message = message.into();
        let lowered = message.to_ascii_lowercase();
        let denied = ["denied", "permission", "not authorized", "unauthorized"]
            .iter()
            .any(|k| lowered.contains(k));
        if denied {
            Self::Permission {
                device,
                reason: message,
            }
        } else if device == "camera" {
            Self::Camera(message)
        } else {
            Self::AudioDevice(message)
        }
    }

    /// `true` for errors caused by the user refusing a device grant.
    pub fn is_permission(&self) -> bool {
        matches!(self, Self::Permission { .. })
    }
}

pub type Result<T> = std::result::Result<T, ParleyError>;
