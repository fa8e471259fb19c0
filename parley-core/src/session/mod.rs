//! `LiveClient`: the session state machine.
//!
//! ## Lifecycle
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──handshake ok──► Connected
//!      ▲                          │                           │
//!      │                    device/handshake            remote close │ remote error
//!      │                        failure                      │         │
//!      └───────disconnect()───────┴──────► Error ◄───────────┼─────────┘
//!      ◄──────────────────────────────────────────────────────┘
//! ```
//!
//! `connect()` may be retried from `Disconnected` or `Error`. `disconnect()`
//! is valid in every state and idempotent.
//!
//! ## Threading
//!
//! The microphone is opened inside a `spawn_blocking` closure and the capture
//! loop runs on that same thread (`cpal::Stream` is `!Send`). The closure
//! reports the open result back over a oneshot and then waits for its
//! `CaptureContext`; dropping the waiting sender releases the microphone.
//!
//! Remote events are serialized by one driver task per session, which also
//! ticks every 50 ms to fold playback completions into `model_speaking` and
//! to expire the transcript line.
//!
//! ## Generations
//!
//! Every connect and every teardown bumps a generation counter. Work that
//! was started for an older generation (a slow handshake, a queued event)
//! is discarded when it completes.

pub mod config;
pub mod diagnostics;
#[cfg(feature = "gemini")]
pub mod gemini;
pub mod outbound;
pub mod transcript;
pub mod transport;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Weak,
};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    capture::{
        self,
        video::{run_snapshots, SnapshotContext},
        CaptureContext,
    },
    codec::{decode_pcm16, sample_rate_from_mime},
    devices::MediaDevices,
    error::{ParleyError, Result},
    ipc::events::{
        ActivityEvent, FeedbackState, SendResultEvent, SessionStatus, SessionStatusEvent,
        TranscriptEvent,
    },
    playback::Playback,
    vad::EnergyVad,
};

pub use config::SessionConfig;
pub use diagnostics::{DiagnosticsSnapshot, SessionDiagnostics};
pub use outbound::OutboundQueue;
pub use transport::{
    LiveSession, LiveTransport, RealtimeInput, ServerEvent, ServerMessage, SessionSetup,
};

/// Broadcast channel capacity: events buffered for slow consumers.
const BROADCAST_CAP: usize = 256;

/// Driver tick: completion draining and transcript expiry.
const TICK: Duration = Duration::from_millis(50);

pub const CONNECTING_LINE: &str = "Connecting...";
pub const LISTENING_LINE: &str = "Parley is listening...";
pub const PERMISSION_LINE: &str = "Failed to initialize. Check permissions.";
pub const CONNECT_ERROR_LINE: &str = "Error connecting to the live service.";
pub const CAMERA_DENIED_LINE: &str = "Camera permission denied.";
pub const CAMERA_UNAVAILABLE_LINE: &str = "Camera unavailable.";

/// Resources held while a session is up.
#[derive(Default)]
struct Active {
    session: Option<Arc<dyn LiveSession>>,
    queue: Option<OutboundQueue>,
    /// Hands the capture thread its context; dropping it releases the mic.
    capture_go: Option<std::sync::mpsc::Sender<CaptureContext>>,
    capture_running: Option<Arc<AtomicBool>>,
    camera_running: Option<Arc<AtomicBool>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Active {
    fn is_empty(&self) -> bool {
        self.session.is_none()
            && self.queue.is_none()
            && self.capture_go.is_none()
            && self.capture_running.is_none()
            && self.camera_running.is_none()
            && self.tasks.is_empty()
    }
}

struct State {
    status: SessionStatus,
    active: Active,
}

struct Inner {
    config: SessionConfig,
    transport: Arc<dyn LiveTransport>,
    devices: Arc<dyn MediaDevices>,

    state: Mutex<State>,
    generation: AtomicU64,
    /// Output device context. Created on first connect, suspended between sessions.
    playback: Mutex<Option<Playback>>,
    transcript: Mutex<transcript::TranscriptDisplay>,

    model_speaking: AtomicBool,
    user_speaking: Arc<AtomicBool>,
    muted: Arc<AtomicBool>,
    camera_active: AtomicBool,

    status_tx: broadcast::Sender<SessionStatusEvent>,
    transcript_tx: broadcast::Sender<TranscriptEvent>,
    activity_tx: broadcast::Sender<ActivityEvent>,
    sends_tx: broadcast::Sender<SendResultEvent>,
    diagnostics: Arc<SessionDiagnostics>,
}

/// Handle to a live voice session. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct LiveClient {
    inner: Arc<Inner>,
}

impl LiveClient {
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn LiveTransport>,
        devices: Arc<dyn MediaDevices>,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (transcript_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (activity_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (sends_tx, _) = broadcast::channel(BROADCAST_CAP);
        let transcript = transcript::TranscriptDisplay::new(config.transcript_clear_after);

        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                devices,
                state: Mutex::new(State {
                    status: SessionStatus::Disconnected,
                    active: Active::default(),
                }),
                generation: AtomicU64::new(0),
                playback: Mutex::new(None),
                transcript: Mutex::new(transcript),
                model_speaking: AtomicBool::new(false),
                user_speaking: Arc::new(AtomicBool::new(false)),
                muted: Arc::new(AtomicBool::new(false)),
                camera_active: AtomicBool::new(false),
                status_tx,
                transcript_tx,
                activity_tx,
                sends_tx,
                diagnostics: Arc::new(SessionDiagnostics::default()),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Open devices and the remote session.
    ///
    /// Resolves once the session is `Connected`, or with the error that moved
    /// it to `Error`.
    ///
    /// # Errors
    /// - `AlreadyConnected` while `Connecting` or `Connected`.
    /// - `Permission` / `AudioDevice` / `NoDefaultInputDevice` when the
    ///   microphone cannot be opened.
    /// - `Handshake` when the remote side refuses the session.
    /// - `ConnectAborted` when `disconnect()` ran while this call was pending.
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        let generation = {
            let mut state = inner.state.lock();
            if state.status.is_active() {
                return Err(ParleyError::AlreadyConnected);
            }
            state.status = SessionStatus::Connecting;
            inner.generation.fetch_add(1, Ordering::SeqCst) + 1
        };
        let span = info_span!("session", generation);
        self.emit_status(SessionStatus::Connecting, None);
        self.show_sticky(CONNECTING_LINE);
        inner.diagnostics.reset();

        self.connect_inner(generation).instrument(span).await
    }

    async fn connect_inner(&self, generation: u64) -> Result<()> {
        let inner = &self.inner;
        info!("connecting");

        // ── Output device context ────────────────────────────────────────────
        if let Err(e) = self.ensure_output(generation).await {
            return Err(self.fail(generation, e));
        }

        // ── Microphone (opened on the capture thread) ────────────────────────
        let (open_tx, open_rx) = oneshot::channel::<Result<u32>>();
        let (go_tx, go_rx) = std::sync::mpsc::channel::<CaptureContext>();
        let devices = Arc::clone(&inner.devices);
        let preferred = inner.config.preferred_input_device.clone();
        {
            // Installed under the lock teardown takes, so a teardown either
            // sees the sender and drops it or this connect sees the new
            // generation and never opens the microphone.
            let mut state = inner.state.lock();
            if !self.is_current(generation) {
                return Err(ParleyError::ConnectAborted);
            }
            state.active.capture_go = Some(go_tx);
        }

        tokio::task::spawn_blocking(move || {
            let mut mic = match devices.open_microphone(preferred.as_deref()) {
                Ok(mic) => mic,
                Err(e) => {
                    let _ = open_tx.send(Err(e));
                    return;
                }
            };
            let _ = open_tx.send(Ok(mic.sample_rate()));
            match go_rx.recv() {
                Ok(ctx) => capture::run(mic, ctx),
                Err(_) => {
                    mic.stop();
                    debug!("microphone released before capture started");
                }
            }
        });

        let capture_rate = match open_rx.await {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => return Err(self.fail(generation, e)),
            Err(_) => {
                return Err(self.fail(
                    generation,
                    ParleyError::Other(anyhow::anyhow!("capture thread died during open")),
                ))
            }
        };
        if !self.is_current(generation) {
            return Err(ParleyError::ConnectAborted);
        }
        info!(capture_rate, "microphone open");

        // ── Remote session ───────────────────────────────────────────────────
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = match inner
            .transport
            .connect(inner.config.setup(), events_tx)
            .await
        {
            Ok(session) => Arc::<dyn LiveSession>::from(session),
            Err(e) => {
                if !self.is_current(generation) {
                    return Err(ParleyError::ConnectAborted);
                }
                let e = match e {
                    ParleyError::Handshake(_) => e,
                    other => ParleyError::Handshake(other.to_string()),
                };
                return Err(self.fail(generation, e));
            }
        };

        // ── Go live ──────────────────────────────────────────────────────────
        if !self.go_live(generation, Arc::clone(&session), events_rx) {
            info!("handshake completed after teardown, closing late session");
            session.close().await;
            return Err(ParleyError::ConnectAborted);
        }

        self.emit_status(SessionStatus::Connected, None);
        self.show_sticky(LISTENING_LINE);
        info!("session connected");
        Ok(())
    }

    /// Start the forwarder, driver and capture loop for `session`. Returns
    /// `false` without touching anything if `generation` is stale.
    fn go_live(
        &self,
        generation: u64,
        session: Arc<dyn LiveSession>,
        events_rx: mpsc::UnboundedReceiver<ServerEvent>,
    ) -> bool {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if !self.is_current(generation) {
            return false;
        }

        let (queue, receiver) = OutboundQueue::channel(
            inner.config.outbound_capacity,
            inner.sends_tx.clone(),
            Arc::clone(&inner.diagnostics),
        );
        let forwarder = tokio::spawn(
            outbound::forward(
                receiver,
                Arc::clone(&session),
                inner.sends_tx.clone(),
                Arc::clone(&inner.diagnostics),
            )
            .in_current_span(),
        );
        let driver = tokio::spawn(
            drive(Arc::downgrade(inner), generation, events_rx).in_current_span(),
        );

        let capture_running = Arc::new(AtomicBool::new(true));
        let ctx = CaptureContext {
            target_sample_rate: inner.config.input_sample_rate,
            window_size: inner.config.window_size,
            vad: Box::new(EnergyVad::new(
                inner.config.vad_threshold,
                inner.config.vad_hangover_windows,
            )),
            queue: queue.clone(),
            running: Arc::clone(&capture_running),
            muted: Arc::clone(&inner.muted),
            user_speaking: Arc::clone(&inner.user_speaking),
            activity_tx: inner.activity_tx.clone(),
            diagnostics: Arc::clone(&inner.diagnostics),
        };
        if let Some(go) = state.active.capture_go.take() {
            let _ = go.send(ctx);
        }

        state.active.session = Some(session);
        state.active.queue = Some(queue);
        state.active.capture_running = Some(capture_running);
        state.active.tasks.push(forwarder);
        state.active.tasks.push(driver);
        state.status = SessionStatus::Connected;
        true
    }

    /// Tear the session down. Valid in every state; repeated calls are no-ops.
    pub fn disconnect(&self) {
        {
            let state = self.inner.state.lock();
            if state.status == SessionStatus::Disconnected && state.active.is_empty() {
                return;
            }
        }
        info!("disconnect requested");
        self.teardown(SessionStatus::Disconnected, None);
    }

    /// Apply one remote event. Events tagged with a stale generation, or
    /// arriving while not `Connected`, are ignored.
    pub fn handle_server_event(&self, generation: u64, event: ServerEvent) {
        if !self.is_current(generation) || self.status() != SessionStatus::Connected {
            debug!(generation, "ignoring event for inactive session");
            return;
        }
        match event {
            ServerEvent::Message(msg) => self.handle_message(msg),
            ServerEvent::Closed { reason } => {
                info!(reason = reason.as_deref().unwrap_or(""), "remote closed session");
                self.teardown(SessionStatus::Disconnected, reason);
            }
            ServerEvent::Error(message) => {
                error!("remote session error: {message}");
                self.teardown(SessionStatus::Error, Some(message));
                self.show_sticky(CONNECT_ERROR_LINE);
            }
        }
    }

    fn handle_message(&self, msg: ServerMessage) {
        let inner = &self.inner;

        for blob in &msg.audio {
            if !blob.is_pcm_audio() {
                debug!(mime = blob.mime_type.as_str(), "skipping non-PCM inline data");
                continue;
            }
            let rate = sample_rate_from_mime(&blob.mime_type).unwrap_or(inner.config.output_sample_rate);
            let audio = match decode_pcm16(&blob.data, rate, 1) {
                Ok(audio) if audio.is_empty() => continue,
                Ok(audio) => audio,
                Err(e) => {
                    SessionDiagnostics::bump(&inner.diagnostics.segments_skipped);
                    warn!("dropping malformed audio segment: {e}");
                    continue;
                }
            };
            let mut playback = inner.playback.lock();
            let Some(playback) = playback.as_mut() else {
                warn!("no output device, audio segment dropped");
                continue;
            };
            match playback.play(audio) {
                Ok(_) => {
                    SessionDiagnostics::bump(&inner.diagnostics.segments_scheduled);
                    inner.model_speaking.store(true, Ordering::Release);
                }
                Err(e) => warn!("failed to schedule audio segment: {e}"),
            }
        }

        if let Some(text) = msg.input_transcription.as_deref() {
            if !text.trim().is_empty() {
                let event = inner.transcript.lock().show_user(text, Instant::now());
                let _ = inner.transcript_tx.send(event);
            }
        }
        if let Some(text) = msg.output_transcription.as_deref() {
            debug!(text, "model transcription");
        }

        if msg.interrupted {
            info!("model interrupted");
            if let Some(playback) = inner.playback.lock().as_mut() {
                playback.interrupt();
            }
            inner.model_speaking.store(false, Ordering::Release);
            SessionDiagnostics::bump(&inner.diagnostics.interruptions);
        }
        if msg.turn_complete {
            debug!("model turn complete");
        }
    }

    /// Fold playback completions into `model_speaking` and expire the
    /// transcript line. Called by the driver every 50 ms.
    pub fn tick(&self, now: Instant) {
        let inner = &self.inner;
        if let Some(playback) = inner.playback.lock().as_mut() {
            let speaking = playback.poll();
            if inner.model_speaking.swap(speaking, Ordering::AcqRel) && !speaking {
                debug!("model finished speaking");
            }
        }
        if let Some(event) = inner.transcript.lock().expire(now) {
            let _ = inner.transcript_tx.send(event);
        }
    }

    /// Muted sessions keep analysing the microphone but send nothing.
    pub fn set_muted(&self, muted: bool) {
        if self.inner.muted.swap(muted, Ordering::AcqRel) != muted {
            info!(muted, "microphone mute changed");
        }
    }

    /// Start sending periodic camera snapshots.
    ///
    /// # Errors
    /// `NotConnected` outside a live session; `Permission` / `Camera` when the
    /// camera cannot be opened (the transcript line says why).
    pub fn start_camera(&self) -> Result<()> {
        let inner = &self.inner;
        let generation = inner.generation.load(Ordering::SeqCst);
        let queue = {
            let state = inner.state.lock();
            if state.status != SessionStatus::Connected {
                return Err(ParleyError::NotConnected);
            }
            if state.active.camera_running.is_some() {
                return Ok(());
            }
            state.active.queue.clone().ok_or(ParleyError::NotConnected)?
        };

        let source = match inner
            .devices
            .open_camera(inner.config.camera_width, inner.config.camera_height)
        {
            Ok(source) => source,
            Err(e) => {
                warn!("camera open failed: {e}");
                self.show_sticky(if e.is_permission() {
                    CAMERA_DENIED_LINE
                } else {
                    CAMERA_UNAVAILABLE_LINE
                });
                return Err(e);
            }
        };

        let running = Arc::new(AtomicBool::new(true));
        {
            let mut state = inner.state.lock();
            if !self.is_current(generation) || state.status != SessionStatus::Connected {
                return Err(ParleyError::ConnectAborted);
            }
            state.active.camera_running = Some(Arc::clone(&running));
        }
        inner.camera_active.store(true, Ordering::Release);

        let ctx = SnapshotContext {
            source,
            queue,
            running,
            interval: inner.config.frame_interval,
            jpeg_quality: inner.config.jpeg_quality,
        };
        tokio::task::spawn_blocking(move || run_snapshots(ctx));
        info!("camera started");
        Ok(())
    }

    pub fn stop_camera(&self) {
        let running = self.inner.state.lock().active.camera_running.take();
        if let Some(running) = running {
            running.store(false, Ordering::Release);
            info!("camera stopped");
        }
        self.inner.camera_active.store(false, Ordering::Release);
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.state.lock().status
    }

    pub fn feedback(&self) -> FeedbackState {
        let inner = &self.inner;
        FeedbackState {
            status: self.status(),
            model_speaking: inner.model_speaking.load(Ordering::Acquire),
            user_speaking: inner.user_speaking.load(Ordering::Acquire),
            muted: inner.muted.load(Ordering::Acquire),
            camera_active: inner.camera_active.load(Ordering::Acquire),
        }
    }

    pub fn transcript(&self) -> Option<String> {
        self.inner.transcript.lock().current().map(str::to_owned)
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.inner.diagnostics.snapshot()
    }

    /// Current session generation; events must carry it to be applied.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.inner.status_tx.subscribe()
    }

    pub fn subscribe_transcript(&self) -> broadcast::Receiver<TranscriptEvent> {
        self.inner.transcript_tx.subscribe()
    }

    pub fn subscribe_activity(&self) -> broadcast::Receiver<ActivityEvent> {
        self.inner.activity_tx.subscribe()
    }

    pub fn subscribe_sends(&self) -> broadcast::Receiver<SendResultEvent> {
        self.inner.sends_tx.subscribe()
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn is_current(&self, generation: u64) -> bool {
        self.inner.generation.load(Ordering::SeqCst) == generation
    }

    /// Create the output device context on first use, then resume it for
    /// `generation`. Opening a device blocks, so it runs on the blocking pool
    /// with no lock held.
    async fn ensure_output(&self, generation: u64) -> Result<()> {
        let inner = &self.inner;
        let needs_open = inner.playback.lock().is_none();
        if needs_open {
            let devices = Arc::clone(&inner.devices);
            let rate = inner.config.output_sample_rate;
            let sink = tokio::task::spawn_blocking(move || devices.open_output(rate))
                .await
                .map_err(|e| ParleyError::Other(anyhow::anyhow!("output open task failed: {e}")))??;
            info!(rate = sink.sample_rate(), "output device context created");
            let mut playback = inner.playback.lock();
            if playback.is_none() {
                *playback = Some(Playback::new(
                    sink,
                    inner.config.interrupt_policy,
                    inner.config.speaking_epsilon_secs,
                ));
            } else {
                drop(playback);
                // Another connect got there first; closing ours joins its thread.
                tokio::task::spawn_blocking(move || drop(sink));
            }
        }

        // Same lock order as teardown (state, then playback): a stale
        // generation leaves the device suspended.
        let _state = inner.state.lock();
        let guard = inner.playback.lock();
        let Some(playback) = guard.as_ref() else {
            return Err(ParleyError::AudioStream("output device context missing".into()));
        };
        if !self.is_current(generation) {
            if let Err(e) = playback.sink().suspend() {
                warn!("failed to suspend output: {e}");
            }
            return Err(ParleyError::ConnectAborted);
        }
        playback.sink().resume()
    }

    /// Move a pending connect to `Error`. Returns the error for the caller.
    fn fail(&self, generation: u64, err: ParleyError) -> ParleyError {
        if !self.is_current(generation) {
            return ParleyError::ConnectAborted;
        }
        error!("connect failed: {err}");
        self.teardown(SessionStatus::Error, Some(err.to_string()));
        self.show_sticky(match err {
            ParleyError::Handshake(_) => CONNECT_ERROR_LINE,
            _ => PERMISSION_LINE,
        });
        err
    }

    /// Release everything and settle in `status`.
    fn teardown(&self, status: SessionStatus, detail: Option<String>) {
        let inner = &self.inner;
        let (active, previous) = {
            let mut state = inner.state.lock();
            inner.generation.fetch_add(1, Ordering::SeqCst);
            let previous = state.status;
            state.status = status;
            // Suspended before the lock is released, so a following connect's
            // resume always lands after it.
            if let Some(playback) = inner.playback.lock().as_mut() {
                playback.interrupt();
                if let Err(e) = playback.sink().suspend() {
                    warn!("failed to suspend output: {e}");
                }
            }
            (std::mem::take(&mut state.active), previous)
        };

        if let Some(running) = &active.capture_running {
            running.store(false, Ordering::Release);
        }
        if let Some(running) = &active.camera_running {
            running.store(false, Ordering::Release);
        }
        for task in &active.tasks {
            task.abort();
        }
        drop(active.capture_go);
        drop(active.queue);

        inner.model_speaking.store(false, Ordering::Release);
        inner.user_speaking.store(false, Ordering::Release);
        inner.camera_active.store(false, Ordering::Release);

        if let Some(event) = inner.transcript.lock().clear() {
            let _ = inner.transcript_tx.send(event);
        }

        if let Some(session) = active.session {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { session.close().await });
                }
                Err(_) => debug!("no runtime, dropping session without close"),
            }
        }

        info!(from = ?previous, to = ?status, "session torn down");
        if previous != status || detail.is_some() {
            self.emit_status(status, detail);
        }
    }

    fn show_sticky(&self, line: &str) {
        let event = self.inner.transcript.lock().show_sticky(line);
        let _ = self.inner.transcript_tx.send(event);
    }

    fn emit_status(&self, status: SessionStatus, detail: Option<String>) {
        let _ = self
            .inner
            .status_tx
            .send(SessionStatusEvent { status, detail });
    }
}

/// Serialize remote events and periodic ticks for one session generation.
async fn drive(
    inner: Weak<Inner>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<ServerEvent>,
) {
    let mut ticker = tokio::time::interval(TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        let event = tokio::select! {
            ev = events.recv() => Some(ev.unwrap_or(ServerEvent::Closed {
                reason: Some("event stream ended".into()),
            })),
            _ = ticker.tick() => None,
        };
        let Some(inner) = inner.upgrade() else { break };
        let client = LiveClient { inner };
        if !client.is_current(generation) {
            break;
        }
        match event {
            Some(ev) => client.handle_server_event(generation, ev),
            None => client.tick(Instant::now()),
        }
    }
    debug!("session driver stopped");
}
