//! The seam between the session state machine and the remote service.
//!
//! A `LiveTransport` performs the handshake and hands back a `LiveSession`
//! for sending. Everything the remote side says arrives on the `ServerEvent`
//! channel passed to `connect`, so one driver task can serialize it.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::codec::MediaBlob;
use crate::error::Result;
use crate::ipc::events::MediaKind;

/// Session parameters sent during the handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSetup {
    pub model: String,
    pub voice_name: String,
    pub system_instruction: String,
    /// Request transcription of the user's speech.
    pub input_transcription: bool,
}

/// One realtime media payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeInput {
    pub kind: MediaKind,
    pub blob: MediaBlob,
}

impl RealtimeInput {
    pub fn audio(blob: MediaBlob) -> Self {
        Self {
            kind: MediaKind::Audio,
            blob,
        }
    }

    pub fn image(blob: MediaBlob) -> Self {
        Self {
            kind: MediaKind::Image,
            blob,
        }
    }
}

/// The parts of one server message the client acts on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerMessage {
    /// Inline audio parts of the model turn, in order.
    pub audio: Vec<MediaBlob>,
    pub input_transcription: Option<String>,
    pub output_transcription: Option<String>,
    pub interrupted: bool,
    pub turn_complete: bool,
}

impl ServerMessage {
    pub fn is_empty(&self) -> bool {
        self.audio.is_empty()
            && self.input_transcription.is_none()
            && self.output_transcription.is_none()
            && !self.interrupted
            && !self.turn_complete
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Message(ServerMessage),
    /// The remote side closed the session.
    Closed { reason: Option<String> },
    /// The remote side reported an error; the session is unusable.
    Error(String),
}

/// An open session.
#[async_trait]
pub trait LiveSession: Send + Sync {
    async fn send(&self, input: RealtimeInput) -> Result<()>;

    /// Close the session. Safe to call more than once.
    async fn close(&self);
}

/// Opens sessions against a remote live service.
#[async_trait]
pub trait LiveTransport: Send + Sync {
    /// Perform the handshake. Resolves once the remote side has accepted the
    /// setup; fails with `ParleyError::Handshake` otherwise.
    async fn connect(
        &self,
        setup: SessionSetup,
        events: mpsc::UnboundedSender<ServerEvent>,
    ) -> Result<Box<dyn LiveSession>>;
}
