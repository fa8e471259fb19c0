//! Gemini Live transport over a WebSocket.
//!
//! ## Wire flow
//!
//! ```text
//! client                                   service
//!   │── {"setup": {...}} ───────────────────►│
//!   │◄────────────────── {"setupComplete":{}}│   handshake done
//!   │── {"realtimeInput": {"mediaChunks"}} ─►│   (repeated)
//!   │◄──────────────── {"serverContent": …} ─│   audio, transcripts, interrupted
//! ```
//!
//! Server frames may arrive as text or as binary UTF-8 JSON. The API key
//! travels in the query string and is scrubbed from every error message.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use async_trait::async_trait;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::transport::{
    LiveSession, LiveTransport, RealtimeInput, ServerEvent, ServerMessage, SessionSetup,
};
use crate::codec::MediaBlob;
use crate::error::{ParleyError, Result};

pub const LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

/// The `setup` message opening a session.
pub fn setup_message(setup: &SessionSetup) -> Value {
    let model = if setup.model.starts_with("models/") {
        setup.model.clone()
    } else {
        format!("models/{}", setup.model)
    };
    let mut body = json!({
        "model": model,
        "generationConfig": {
            "responseModalities": ["AUDIO"],
            "speechConfig": {
                "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": setup.voice_name } }
            }
        },
        "systemInstruction": { "parts": [{ "text": setup.system_instruction }] }
    });
    if setup.input_transcription {
        body["inputAudioTranscription"] = json!({});
    }
    json!({ "setup": body })
}

pub fn realtime_input_message(input: &RealtimeInput) -> Value {
    json!({
        "realtimeInput": {
            "mediaChunks": [{
                "mimeType": input.blob.mime_type,
                "data": input.blob.data,
            }]
        }
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFrame {
    setup_complete: Option<Value>,
    server_content: Option<WireServerContent>,
    go_away: Option<Value>,
    error: Option<WireError>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WireServerContent {
    model_turn: Option<WireContent>,
    input_transcription: Option<WireTranscription>,
    output_transcription: Option<WireTranscription>,
    interrupted: bool,
    turn_complete: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireContent {
    parts: Vec<WirePart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WirePart {
    inline_data: Option<MediaBlob>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireTranscription {
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireError {
    message: String,
}

/// What one server frame means to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    SetupComplete,
    Message(ServerMessage),
    /// The service will close the session soon.
    GoAway,
    Error(String),
    /// Valid JSON the client has no use for (tool calls, usage metadata).
    Ignored,
}

/// Parse one JSON server frame.
pub fn parse_server_frame(text: &str) -> std::result::Result<ServerFrame, serde_json::Error> {
    let frame: WireFrame = serde_json::from_str(text)?;
    if frame.setup_complete.is_some() {
        return Ok(ServerFrame::SetupComplete);
    }
    if let Some(err) = frame.error {
        return Ok(ServerFrame::Error(err.message));
    }
    if let Some(content) = frame.server_content {
        let audio = content
            .model_turn
            .map(|turn| {
                turn.parts
                    .into_iter()
                    .filter_map(|p| p.inline_data)
                    .collect()
            })
            .unwrap_or_default();
        let msg = ServerMessage {
            audio,
            input_transcription: content.input_transcription.and_then(|t| t.text),
            output_transcription: content.output_transcription.and_then(|t| t.text),
            interrupted: content.interrupted,
            turn_complete: content.turn_complete,
        };
        return Ok(if msg.is_empty() {
            ServerFrame::Ignored
        } else {
            ServerFrame::Message(msg)
        });
    }
    if frame.go_away.is_some() {
        return Ok(ServerFrame::GoAway);
    }
    Ok(ServerFrame::Ignored)
}

fn frame_text(msg: &Message) -> Option<&str> {
    match msg {
        Message::Text(text) => Some(text.as_str()),
        Message::Binary(bytes) => std::str::from_utf8(bytes).ok(),
        _ => None,
    }
}

fn close_reason(msg: &Message) -> Option<Option<String>> {
    match msg {
        Message::Close(frame) => Some(
            frame
                .as_ref()
                .map(|f| f.reason.to_string())
                .filter(|r| !r.is_empty()),
        ),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

pub struct GeminiTransport {
    api_key: String,
    endpoint: String,
    handshake_timeout: Duration,
}

impl std::fmt::Debug for GeminiTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiTransport")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl GeminiTransport {
    pub fn new(api_key: impl Into<String>) -> Self {
        // Fails only when a provider is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();
        Self {
            api_key: api_key.into(),
            endpoint: LIVE_ENDPOINT.to_string(),
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    fn redact(&self, message: impl std::fmt::Display) -> String {
        let message = message.to_string();
        if self.api_key.is_empty() {
            message
        } else {
            message.replace(&self.api_key, "<redacted>")
        }
    }

    async fn handshake(&self, setup: &SessionSetup) -> Result<WsStream> {
        let url = format!("{}?key={}", self.endpoint, self.api_key);
        let (mut ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ParleyError::Handshake(self.redact(e)))?;
        debug!("websocket open, sending setup");

        ws.send(Message::Text(setup_message(setup).to_string()))
            .await
            .map_err(|e| ParleyError::Handshake(self.redact(e)))?;

        loop {
            let msg = match ws.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Err(ParleyError::Handshake(self.redact(e))),
                None => return Err(ParleyError::Handshake("connection closed during setup".into())),
            };
            if let Some(reason) = close_reason(&msg) {
                return Err(ParleyError::Handshake(
                    reason.unwrap_or_else(|| "connection closed during setup".into()),
                ));
            }
            let Some(text) = frame_text(&msg) else { continue };
            match parse_server_frame(text) {
                Ok(ServerFrame::SetupComplete) => return Ok(ws),
                Ok(ServerFrame::Error(message)) => return Err(ParleyError::Handshake(message)),
                Ok(other) => debug!(?other, "frame before setupComplete ignored"),
                Err(e) => warn!("unparseable frame during setup: {e}"),
            }
        }
    }
}

#[async_trait]
impl LiveTransport for GeminiTransport {
    async fn connect(
        &self,
        setup: SessionSetup,
        events: mpsc::UnboundedSender<ServerEvent>,
    ) -> Result<Box<dyn LiveSession>> {
        if self.api_key.trim().is_empty() {
            return Err(ParleyError::Handshake("no API key configured".into()));
        }
        info!(model = setup.model.as_str(), voice = setup.voice_name.as_str(), "opening live session");

        let ws = tokio::time::timeout(self.handshake_timeout, self.handshake(&setup))
            .await
            .map_err(|_| ParleyError::Handshake("timed out waiting for setupComplete".into()))??;
        info!("live session setup complete");

        let (sink, stream) = ws.split();
        let reader = tokio::spawn(read_frames(stream, events));
        Ok(Box::new(GeminiSession {
            sink: tokio::sync::Mutex::new(sink),
            reader: parking_lot::Mutex::new(Some(reader)),
            closed: AtomicBool::new(false),
        }))
    }
}

async fn read_frames(mut stream: SplitStream<WsStream>, events: mpsc::UnboundedSender<ServerEvent>) {
    let final_event = loop {
        let msg = match stream.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => break ServerEvent::Error(e.to_string()),
            None => break ServerEvent::Closed { reason: None },
        };
        if let Some(reason) = close_reason(&msg) {
            break ServerEvent::Closed { reason };
        }
        let Some(text) = frame_text(&msg) else { continue };
        match parse_server_frame(text) {
            Ok(ServerFrame::Message(m)) => {
                if events.send(ServerEvent::Message(m)).is_err() {
                    return;
                }
            }
            Ok(ServerFrame::Error(message)) => break ServerEvent::Error(message),
            Ok(ServerFrame::GoAway) => info!("service announced session end"),
            Ok(ServerFrame::SetupComplete | ServerFrame::Ignored) => {}
            Err(e) => warn!("unparseable server frame skipped: {e}"),
        }
    };
    let _ = events.send(final_event);
}

struct GeminiSession {
    sink: tokio::sync::Mutex<SplitSink<WsStream, Message>>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

#[async_trait]
impl LiveSession for GeminiSession {
    async fn send(&self, input: RealtimeInput) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ParleyError::NotConnected);
        }
        let text = realtime_input_message(&input).to_string();
        self.sink
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|e| ParleyError::Remote(e.to_string()))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.sink.lock().await.close().await {
            debug!("websocket close: {e}");
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        info!("live session closed");
    }
}

impl Drop for GeminiSession {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}
