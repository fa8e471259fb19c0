//! End-to-end session lifecycle against an in-process transport and fake
//! devices. The output device runs on a hand-driven clock.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use async_trait::async_trait;
use approx::assert_abs_diff_eq;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use parley_core::audio::{MicrophoneStream, RingMicrophone};
use parley_core::buffering::{AudioProducer, Producer};
use parley_core::capture::video::FrameSource;
use parley_core::codec::{encode_pcm16, image::RgbFrame, pcm_mime, MediaBlob};
use parley_core::playback::{OutputSink, ScheduledSegment, SegmentId};
use parley_core::session::transcript::USER_PREFIX;
use parley_core::session::{
    RealtimeInput, ServerEvent, ServerMessage, SessionSetup, CAMERA_DENIED_LINE,
    CONNECT_ERROR_LINE, LISTENING_LINE, PERMISSION_LINE,
};
use parley_core::{
    LiveClient, LiveSession, LiveTransport, MediaDevices, MediaKind, ParleyError, Result,
    SessionConfig, SessionStatus,
};

// ── Fakes ────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq)]
enum Handshake {
    Accept,
    Refuse,
    Delay(Duration),
}

struct FakeTransport {
    handshake: Mutex<Handshake>,
    connects: AtomicUsize,
    closes: Arc<AtomicUsize>,
    sent: Arc<Mutex<Vec<RealtimeInput>>>,
    events: Mutex<Option<mpsc::UnboundedSender<ServerEvent>>>,
}

impl FakeTransport {
    fn new(handshake: Handshake) -> Arc<Self> {
        Arc::new(Self {
            handshake: Mutex::new(handshake),
            connects: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
            sent: Arc::new(Mutex::new(Vec::new())),
            events: Mutex::new(None),
        })
    }

    fn push(&self, event: ServerEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    fn sent_of(&self, kind: MediaKind) -> Vec<RealtimeInput> {
        self.sent
            .lock()
            .iter()
            .filter(|i| i.kind == kind)
            .cloned()
            .collect()
    }
}

struct FakeSession {
    sent: Arc<Mutex<Vec<RealtimeInput>>>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl LiveSession for FakeSession {
    async fn send(&self, input: RealtimeInput) -> Result<()> {
        self.sent.lock().push(input);
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl LiveTransport for FakeTransport {
    async fn connect(
        &self,
        _setup: SessionSetup,
        events: mpsc::UnboundedSender<ServerEvent>,
    ) -> Result<Box<dyn LiveSession>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let handshake = *self.handshake.lock();
        match handshake {
            Handshake::Refuse => return Err(ParleyError::Handshake("API key not valid".into())),
            Handshake::Delay(d) => tokio::time::sleep(d).await,
            Handshake::Accept => {}
        }
        *self.events.lock() = Some(events);
        Ok(Box::new(FakeSession {
            sent: Arc::clone(&self.sent),
            closes: Arc::clone(&self.closes),
        }))
    }
}

#[derive(Default)]
struct ManualSink {
    now: Mutex<f64>,
    queued: Mutex<Vec<ScheduledSegment>>,
    finished: Mutex<Vec<SegmentId>>,
    suspended: AtomicBool,
}

impl ManualSink {
    fn finish_all(&self) {
        let ids: Vec<SegmentId> = self.queued.lock().iter().map(|s| s.id).collect();
        self.finished.lock().extend(ids);
    }
}

impl OutputSink for ManualSink {
    fn current_time(&self) -> f64 {
        *self.now.lock()
    }
    fn sample_rate(&self) -> u32 {
        24_000
    }
    fn enqueue(&self, segment: ScheduledSegment) -> Result<()> {
        self.queued.lock().push(segment);
        Ok(())
    }
    fn cancel_pending(&self) -> Vec<SegmentId> {
        self.queued.lock().drain(..).map(|s| s.id).collect()
    }
    fn drain_finished(&self) -> Vec<SegmentId> {
        std::mem::take(&mut *self.finished.lock())
    }
    fn reports_completion(&self) -> bool {
        true
    }
    fn suspend(&self) -> Result<()> {
        self.suspended.store(true, Ordering::SeqCst);
        Ok(())
    }
    fn resume(&self) -> Result<()> {
        self.suspended.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Camera {
    Working,
    Denied,
}

struct StubCamera;

impl FrameSource for StubCamera {
    fn grab(&mut self) -> Result<RgbFrame> {
        RgbFrame::new(4, 4, vec![128; 4 * 4 * 3])
    }
    fn stop(&mut self) {}
}

struct FakeDevices {
    sink: Arc<ManualSink>,
    deny_mic: bool,
    camera: Camera,
    mic_feed: Mutex<Option<AudioProducer>>,
    mic_stopped: Mutex<Option<Arc<AtomicBool>>>,
    /// When set, `open_output` blocks until a value arrives.
    output_gate: Mutex<Option<crossbeam_channel::Receiver<()>>>,
    output_opening: AtomicBool,
}

impl FakeDevices {
    fn new() -> Arc<Self> {
        Self::with(false, Camera::Working)
    }

    fn with(deny_mic: bool, camera: Camera) -> Arc<Self> {
        Arc::new(Self {
            sink: Arc::new(ManualSink::default()),
            deny_mic,
            camera,
            mic_feed: Mutex::new(None),
            mic_stopped: Mutex::new(None),
            output_gate: Mutex::new(None),
            output_opening: AtomicBool::new(false),
        })
    }

    fn speak(&self, samples: &[f32]) {
        if let Some(producer) = self.mic_feed.lock().as_mut() {
            producer.push_slice(samples);
        }
    }

    fn mic_released(&self) -> bool {
        self.mic_stopped
            .lock()
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }
}

impl MediaDevices for FakeDevices {
    fn open_output(&self, _preferred_rate: u32) -> Result<Arc<dyn OutputSink>> {
        let gate = self.output_gate.lock().take();
        self.output_opening.store(true, Ordering::SeqCst);
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
        Ok(self.sink.clone())
    }

    fn open_microphone(&self, _preferred: Option<&str>) -> Result<Box<dyn MicrophoneStream>> {
        if self.deny_mic {
            return Err(ParleyError::Permission {
                device: "microphone",
                reason: "denied by user".into(),
            });
        }
        let (mic, producer) = RingMicrophone::new(16_000);
        *self.mic_stopped.lock() = Some(mic.stopped_flag());
        *self.mic_feed.lock() = Some(producer);
        Ok(Box::new(mic))
    }

    fn open_camera(&self, _width: u32, _height: u32) -> Result<Box<dyn FrameSource>> {
        match self.camera {
            Camera::Working => Ok(Box::new(StubCamera)),
            Camera::Denied => Err(ParleyError::Permission {
                device: "camera",
                reason: "permission denied".into(),
            }),
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn config() -> SessionConfig {
    SessionConfig {
        transcript_clear_after: Duration::from_millis(200),
        frame_interval: Duration::from_millis(50),
        ..SessionConfig::default()
    }
}

fn client(transport: &Arc<FakeTransport>, devices: &Arc<FakeDevices>) -> LiveClient {
    LiveClient::new(config(), transport.clone(), devices.clone())
}

async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

fn loud_window() -> Vec<f32> {
    (0..4096)
        .map(|i| 0.5 * (i as f32 * 0.05).sin())
        .collect()
}

fn speech_message(seconds: f64) -> ServerEvent {
    let samples = vec![0.1f32; (24_000.0 * seconds) as usize];
    ServerEvent::Message(ServerMessage {
        audio: vec![MediaBlob::new(pcm_mime(24_000), encode_pcm16(&samples))],
        ..ServerMessage::default()
    })
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn full_conversation_round_trip() {
    let transport = FakeTransport::new(Handshake::Accept);
    let devices = FakeDevices::new();
    let client = client(&transport, &devices);
    let mut status_rx = client.subscribe_status();

    client.connect().await.unwrap();
    assert_eq!(client.status(), SessionStatus::Connected);
    assert_eq!(client.transcript().as_deref(), Some(LISTENING_LINE));
    assert_eq!(status_rx.recv().await.unwrap().status, SessionStatus::Connecting);
    assert_eq!(status_rx.recv().await.unwrap().status, SessionStatus::Connected);

    // User speaks: one full window goes out as 16 kHz PCM.
    devices.speak(&loud_window());
    assert!(eventually(|| !transport.sent_of(MediaKind::Audio).is_empty()).await);
    let sent = transport.sent_of(MediaKind::Audio);
    assert_eq!(sent[0].blob.mime_type, "audio/pcm;rate=16000");
    let snap = client.diagnostics();
    assert!(snap.windows_speech >= 1);

    // Model answers with two segments; they chain on the device timeline.
    transport.push(speech_message(1.0));
    transport.push(speech_message(0.5));
    assert!(eventually(|| devices.sink.queued.lock().len() == 2).await);
    assert!(eventually(|| client.feedback().model_speaking).await);
    {
        let queued = devices.sink.queued.lock();
        assert_abs_diff_eq!(queued[0].start_time, 0.0);
        assert_abs_diff_eq!(queued[1].start_time, 1.0, epsilon = 1e-9);
    }

    // Device reports completion; the driver tick clears the flag.
    *devices.sink.now.lock() = 1.5;
    devices.sink.finish_all();
    assert!(eventually(|| !client.feedback().model_speaking).await);

    client.disconnect();
    assert_eq!(client.status(), SessionStatus::Disconnected);
    assert!(devices.sink.suspended.load(Ordering::SeqCst));
    assert!(client.transcript().is_none());
    assert!(eventually(|| transport.closes.load(Ordering::SeqCst) == 1).await);
    assert!(eventually(|| devices.mic_released()).await);
}

#[tokio::test]
async fn denied_microphone_moves_to_error() {
    let transport = FakeTransport::new(Handshake::Accept);
    let devices = FakeDevices::with(true, Camera::Working);
    let client = client(&transport, &devices);

    let err = client.connect().await.unwrap_err();
    assert!(err.is_permission());
    assert_eq!(client.status(), SessionStatus::Error);
    assert_eq!(client.transcript().as_deref(), Some(PERMISSION_LINE));
    assert_eq!(transport.connects.load(Ordering::SeqCst), 0);

    // Retry from Error is allowed.
    let again = client.connect().await.unwrap_err();
    assert!(again.is_permission());
}

#[tokio::test]
async fn refused_handshake_releases_microphone() {
    let transport = FakeTransport::new(Handshake::Refuse);
    let devices = FakeDevices::new();
    let client = client(&transport, &devices);

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, ParleyError::Handshake(_)));
    assert_eq!(client.status(), SessionStatus::Error);
    assert_eq!(client.transcript().as_deref(), Some(CONNECT_ERROR_LINE));
    assert!(eventually(|| devices.mic_released()).await);

    *transport.handshake.lock() = Handshake::Accept;
    client.connect().await.unwrap();
    assert_eq!(client.status(), SessionStatus::Connected);
    client.disconnect();
}

#[tokio::test]
async fn connect_while_active_is_rejected() {
    let transport = FakeTransport::new(Handshake::Accept);
    let devices = FakeDevices::new();
    let client = client(&transport, &devices);

    client.connect().await.unwrap();
    assert!(matches!(
        client.connect().await,
        Err(ParleyError::AlreadyConnected)
    ));
    client.disconnect();
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let transport = FakeTransport::new(Handshake::Accept);
    let devices = FakeDevices::new();
    let client = client(&transport, &devices);
    let mut status_rx = client.subscribe_status();

    // Nothing to tear down yet.
    client.disconnect();
    assert!(status_rx.try_recv().is_err());

    client.connect().await.unwrap();
    client.disconnect();
    client.disconnect();

    let mut disconnected = 0;
    while let Ok(event) = status_rx.try_recv() {
        if event.status == SessionStatus::Disconnected {
            disconnected += 1;
        }
    }
    assert_eq!(disconnected, 1);
    assert!(eventually(|| transport.closes.load(Ordering::SeqCst) == 1).await);
}

#[tokio::test]
async fn disconnect_stops_every_scheduled_callback() {
    let transport = FakeTransport::new(Handshake::Accept);
    let devices = FakeDevices::new();
    let client = client(&transport, &devices);
    client.connect().await.unwrap();

    client.start_camera().unwrap();
    assert!(eventually(|| !transport.sent_of(MediaKind::Image).is_empty()).await);
    transport.push(ServerEvent::Message(ServerMessage {
        input_transcription: Some("hello there".into()),
        ..ServerMessage::default()
    }));
    assert!(eventually(|| client.transcript().is_some_and(|t| t.starts_with(USER_PREFIX))).await);

    let mut transcript_rx = client.subscribe_transcript();
    let mut activity_rx = client.subscribe_activity();
    client.disconnect();
    client.disconnect();
    assert!(client.transcript().is_none());
    while transcript_rx.try_recv().is_ok() {}
    while activity_rx.try_recv().is_ok() {}
    let images = transport.sent_of(MediaKind::Image).len();
    let audio = transport.sent_of(MediaKind::Audio).len();

    // Several frame intervals and past the transcript clear deadline.
    devices.speak(&loud_window());
    tokio::time::sleep(Duration::from_millis(350)).await;

    assert_eq!(transport.sent_of(MediaKind::Image).len(), images);
    assert_eq!(transport.sent_of(MediaKind::Audio).len(), audio);
    assert!(transcript_rx.try_recv().is_err());
    assert!(activity_rx.try_recv().is_err());
    assert!(!client.feedback().camera_active);
    assert!(client.transcript().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_during_output_open_leaves_nothing_held() {
    let transport = FakeTransport::new(Handshake::Accept);
    let devices = FakeDevices::new();
    let (release, gate) = crossbeam_channel::bounded::<()>(1);
    *devices.output_gate.lock() = Some(gate);
    let client = client(&transport, &devices);

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };
    assert!(eventually(|| devices.output_opening.load(Ordering::SeqCst)).await);

    // Returns while the device open is still blocked.
    client.disconnect();
    assert_eq!(client.status(), SessionStatus::Disconnected);
    release.send(()).unwrap();

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(ParleyError::ConnectAborted)));
    assert_eq!(client.status(), SessionStatus::Disconnected);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mic_held = devices.mic_stopped.lock().is_some() && !devices.mic_released();
    assert!(!mic_held, "microphone still held after disconnect");
    assert!(devices.sink.suspended.load(Ordering::SeqCst));
    assert_eq!(transport.connects.load(Ordering::SeqCst), 0);

    // The output context survives and is resumed by the next session.
    client.connect().await.unwrap();
    assert!(!devices.sink.suspended.load(Ordering::SeqCst));
    client.disconnect();
    assert!(devices.sink.suspended.load(Ordering::SeqCst));
    assert!(eventually(|| devices.mic_released()).await);
}

#[tokio::test]
async fn late_handshake_is_closed_and_discarded() {
    let transport = FakeTransport::new(Handshake::Delay(Duration::from_millis(200)));
    let devices = FakeDevices::new();
    let client = client(&transport, &devices);

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };
    assert!(eventually(|| transport.connects.load(Ordering::SeqCst) == 1).await);
    assert_eq!(client.status(), SessionStatus::Connecting);

    client.disconnect();
    assert_eq!(client.status(), SessionStatus::Disconnected);

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(ParleyError::ConnectAborted)));
    assert_eq!(client.status(), SessionStatus::Disconnected);
    assert!(eventually(|| transport.closes.load(Ordering::SeqCst) == 1).await);
    assert!(eventually(|| devices.mic_released()).await);
}

#[tokio::test]
async fn malformed_segment_is_skipped() {
    let transport = FakeTransport::new(Handshake::Accept);
    let devices = FakeDevices::new();
    let client = client(&transport, &devices);
    client.connect().await.unwrap();

    transport.push(ServerEvent::Message(ServerMessage {
        audio: vec![
            // Three bytes: not a whole PCM16 frame.
            MediaBlob::new(pcm_mime(24_000), "AAAA"),
            MediaBlob::new(pcm_mime(24_000), encode_pcm16(&[0.2; 2_400])),
        ],
        ..ServerMessage::default()
    }));
    assert!(eventually(|| client.diagnostics().segments_scheduled == 1).await);
    assert_eq!(client.diagnostics().segments_skipped, 1);
    assert_eq!(devices.sink.queued.lock().len(), 1);
    assert_eq!(client.status(), SessionStatus::Connected);
    client.disconnect();
}

#[tokio::test]
async fn remote_close_returns_to_disconnected() {
    let transport = FakeTransport::new(Handshake::Accept);
    let devices = FakeDevices::new();
    let client = client(&transport, &devices);
    let mut status_rx = client.subscribe_status();
    client.connect().await.unwrap();

    transport.push(ServerEvent::Closed {
        reason: Some("session expired".into()),
    });
    assert!(eventually(|| client.status() == SessionStatus::Disconnected).await);

    let mut last = None;
    while let Ok(event) = status_rx.try_recv() {
        last = Some(event);
    }
    let last = last.unwrap();
    assert_eq!(last.status, SessionStatus::Disconnected);
    assert_eq!(last.detail.as_deref(), Some("session expired"));
    assert!(eventually(|| devices.mic_released()).await);
}

#[tokio::test]
async fn remote_error_moves_to_error() {
    let transport = FakeTransport::new(Handshake::Accept);
    let devices = FakeDevices::new();
    let client = client(&transport, &devices);
    client.connect().await.unwrap();

    transport.push(ServerEvent::Error("internal error".into()));
    assert!(eventually(|| client.status() == SessionStatus::Error).await);
    assert_eq!(client.transcript().as_deref(), Some(CONNECT_ERROR_LINE));

    // Events after teardown are ignored.
    transport.push(speech_message(0.5));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(devices.sink.queued.lock().is_empty());
}

#[tokio::test]
async fn interruption_resets_the_cursor() {
    let transport = FakeTransport::new(Handshake::Accept);
    let devices = FakeDevices::new();
    let client = client(&transport, &devices);
    client.connect().await.unwrap();

    transport.push(speech_message(1.0));
    assert!(eventually(|| devices.sink.queued.lock().len() == 1).await);

    transport.push(ServerEvent::Message(ServerMessage {
        interrupted: true,
        ..ServerMessage::default()
    }));
    assert!(eventually(|| client.diagnostics().interruptions == 1).await);
    assert!(!client.feedback().model_speaking);

    *devices.sink.now.lock() = 0.25;
    transport.push(speech_message(0.5));
    assert!(eventually(|| devices.sink.queued.lock().len() == 2).await);
    assert_abs_diff_eq!(devices.sink.queued.lock()[1].start_time, 0.25);
    client.disconnect();
}

#[tokio::test]
async fn user_transcript_clears_itself() {
    let transport = FakeTransport::new(Handshake::Accept);
    let devices = FakeDevices::new();
    let client = client(&transport, &devices);
    client.connect().await.unwrap();

    transport.push(ServerEvent::Message(ServerMessage {
        input_transcription: Some("what's the weather".into()),
        ..ServerMessage::default()
    }));
    let expected = format!("{USER_PREFIX}what's the weather");
    assert!(eventually(|| client.transcript().as_deref() == Some(expected.as_str())).await);
    assert!(eventually(|| client.transcript().is_none()).await);
    client.disconnect();
}

#[tokio::test]
async fn muted_microphone_sends_nothing() {
    let transport = FakeTransport::new(Handshake::Accept);
    let devices = FakeDevices::new();
    let client = client(&transport, &devices);
    client.set_muted(true);
    client.connect().await.unwrap();

    devices.speak(&loud_window());
    devices.speak(&loud_window());
    assert!(eventually(|| client.diagnostics().windows_muted == 2).await);
    assert!(transport.sent_of(MediaKind::Audio).is_empty());
    assert!(client.feedback().muted);

    client.set_muted(false);
    devices.speak(&loud_window());
    assert!(eventually(|| transport.sent_of(MediaKind::Audio).len() == 1).await);

    // Mute is a preference and survives the session.
    client.set_muted(true);
    client.disconnect();
    assert!(client.feedback().muted);
}

#[tokio::test]
async fn camera_sends_jpeg_snapshots() {
    let transport = FakeTransport::new(Handshake::Accept);
    let devices = FakeDevices::new();
    let client = client(&transport, &devices);

    assert!(matches!(client.start_camera(), Err(ParleyError::NotConnected)));

    client.connect().await.unwrap();
    client.start_camera().unwrap();
    assert!(client.feedback().camera_active);
    assert!(eventually(|| transport.sent_of(MediaKind::Image).len() >= 2).await);
    assert_eq!(
        transport.sent_of(MediaKind::Image)[0].blob.mime_type,
        "image/jpeg"
    );

    client.stop_camera();
    assert!(!client.feedback().camera_active);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let settled = transport.sent_of(MediaKind::Image).len();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(transport.sent_of(MediaKind::Image).len(), settled);
    client.disconnect();
}

#[tokio::test]
async fn denied_camera_keeps_session_up() {
    let transport = FakeTransport::new(Handshake::Accept);
    let devices = FakeDevices::with(false, Camera::Denied);
    let client = client(&transport, &devices);
    client.connect().await.unwrap();

    let err = client.start_camera().unwrap_err();
    assert!(err.is_permission());
    assert_eq!(client.transcript().as_deref(), Some(CAMERA_DENIED_LINE));
    assert!(!client.feedback().camera_active);
    assert_eq!(client.status(), SessionStatus::Connected);
    client.disconnect();
}
