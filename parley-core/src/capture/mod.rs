//! Blocking microphone capture loop.
//!
//! ## Stages (per iteration)
//!
//! ```text
//! 1. Drain the microphone (ring-backed, never blocks)
//! 2. Resample to the session input rate
//! 3. Assemble fixed windows (4096 samples by default)
//! 4. Per window: RMS + VAD → user_speaking flag + ActivityEvent
//! 5. Unless muted: PCM16/base64 encode → outbound queue
//! ```
//!
//! The loop runs in `spawn_blocking` on the same thread that opened the
//! microphone, and releases the microphone on that thread when it exits.

pub mod video;

use std::sync::OnceLock;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::{
    audio::{resample::RateConverter, MicrophoneStream},
    buffering::{chunk::AudioChunk, window::WindowAssembler},
    codec::pcm_blob,
    error::ParleyError,
    ipc::events::ActivityEvent,
    session::{diagnostics::SessionDiagnostics, outbound::OutboundQueue, transport::RealtimeInput},
    vad::{rms, VoiceActivityDetector},
};

/// Samples drained from the microphone per iteration.
const DRAIN_CHUNK: usize = 960;

/// Sleep when the microphone has nothing buffered.
const DEFAULT_SLEEP_EMPTY_MS: u64 = 5;

/// Everything the loop needs, passed as one struct so the closure stays tidy.
pub struct CaptureContext {
    pub target_sample_rate: u32,
    pub window_size: usize,
    pub vad: Box<dyn VoiceActivityDetector>,
    pub queue: OutboundQueue,
    pub running: Arc<AtomicBool>,
    pub muted: Arc<AtomicBool>,
    pub user_speaking: Arc<AtomicBool>,
    pub activity_tx: broadcast::Sender<ActivityEvent>,
    pub diagnostics: Arc<SessionDiagnostics>,
}

/// Run until `ctx.running` clears or the outbound queue closes.
pub fn run(mut mic: Box<dyn MicrophoneStream>, mut ctx: CaptureContext) {
    let capture_rate = mic.sample_rate();
    info!(capture_rate, target = ctx.target_sample_rate, "capture loop started");

    let mut resampler = match RateConverter::new(capture_rate, ctx.target_sample_rate, DRAIN_CHUNK)
    {
        Ok(r) => r,
        Err(e) => {
            error!("failed to create capture resampler: {e}");
            mic.stop();
            return;
        }
    };
    let mut windows = WindowAssembler::new(ctx.window_size, ctx.target_sample_rate);
    let mut raw = vec![0f32; DRAIN_CHUNK];
    let mut activity_seq = 0u64;

    'capture: loop {
        if !ctx.running.load(Ordering::Acquire) {
            break;
        }

        let n = mic.read(&mut raw);
        if n == 0 {
            std::thread::sleep(Duration::from_millis(empty_sleep_ms()));
            continue;
        }
        ctx.diagnostics
            .frames_captured
            .fetch_add(n, Ordering::Relaxed);

        let resampled = resampler.process(&raw[..n]);
        for window in windows.push(&resampled) {
            if !process_window(&mut ctx, window, &mut activity_seq) {
                break 'capture;
            }
        }
    }

    mic.stop();
    ctx.user_speaking.store(false, Ordering::Release);
    ctx.vad.reset();

    let snap = ctx.diagnostics.snapshot();
    info!(
        windows = snap.windows_captured,
        speech = snap.windows_speech,
        muted = snap.windows_muted,
        "capture loop stopped"
    );
}

/// Analyse one window and submit it. Returns `false` when the loop should end.
fn process_window(ctx: &mut CaptureContext, window: AudioChunk, seq: &mut u64) -> bool {
    let level = rms(&window.samples);
    let is_speech = ctx.vad.classify(&window).is_speech();

    ctx.user_speaking.store(is_speech, Ordering::Release);
    SessionDiagnostics::bump(&ctx.diagnostics.windows_captured);
    if is_speech {
        SessionDiagnostics::bump(&ctx.diagnostics.windows_speech);
    }
    *seq += 1;
    let _ = ctx.activity_tx.send(ActivityEvent {
        seq: *seq,
        rms: level,
        is_speech,
    });

    if ctx.muted.load(Ordering::Acquire) {
        SessionDiagnostics::bump(&ctx.diagnostics.windows_muted);
        return true;
    }
    if !ctx.running.load(Ordering::Acquire) {
        return false;
    }

    let blob = pcm_blob(&window.samples, window.sample_rate);
    match ctx.queue.submit(RealtimeInput::audio(blob)) {
        Ok(out_seq) => {
            debug!(out_seq, rms = level, is_speech, "window queued");
            true
        }
        Err(ParleyError::NotConnected) => {
            debug!("outbound queue closed, ending capture");
            false
        }
        Err(_) => true,
    }
}

fn empty_sleep_ms() -> u64 {
    static EMPTY_SLEEP_MS: OnceLock<u64> = OnceLock::new();
    *EMPTY_SLEEP_MS.get_or_init(|| {
        std::env::var("PARLEY_CAPTURE_EMPTY_SLEEP_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(|v| v.clamp(1, 20))
            .unwrap_or(DEFAULT_SLEEP_EMPTY_MS)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::RingMicrophone;
    use crate::buffering::Producer;
    use crate::codec::decode_pcm16;
    use crate::ipc::events::MediaKind;
    use crate::session::outbound::OutboundReceiver;
    use crate::vad::EnergyVad;
    use std::time::Instant;

    struct Harness {
        running: Arc<AtomicBool>,
        muted: Arc<AtomicBool>,
        user_speaking: Arc<AtomicBool>,
        activity_rx: broadcast::Receiver<ActivityEvent>,
        outbound: OutboundReceiver,
        diagnostics: Arc<SessionDiagnostics>,
        ctx: Option<CaptureContext>,
    }

    fn harness(window_size: usize) -> Harness {
        let (results, _) = broadcast::channel(64);
        let (activity_tx, activity_rx) = broadcast::channel(64);
        let diagnostics = Arc::new(SessionDiagnostics::default());
        let (queue, outbound) = OutboundQueue::channel(64, results, Arc::clone(&diagnostics));
        let running = Arc::new(AtomicBool::new(true));
        let muted = Arc::new(AtomicBool::new(false));
        let user_speaking = Arc::new(AtomicBool::new(false));
        let ctx = CaptureContext {
            target_sample_rate: 16_000,
            window_size,
            vad: Box::new(EnergyVad::default()),
            queue,
            running: Arc::clone(&running),
            muted: Arc::clone(&muted),
            user_speaking: Arc::clone(&user_speaking),
            activity_tx,
            diagnostics: Arc::clone(&diagnostics),
        };
        Harness {
            running,
            muted,
            user_speaking,
            activity_rx,
            outbound,
            diagnostics,
            ctx: Some(ctx),
        }
    }

    fn run_until_windows(h: &mut Harness, samples: &[f32], windows: usize) {
        let (mic, mut producer) = RingMicrophone::new(16_000);
        producer.push_slice(samples);
        let ctx = h.ctx.take().unwrap();
        let handle = std::thread::spawn(move || run(Box::new(mic), ctx));

        let deadline = Instant::now() + Duration::from_secs(5);
        while h.diagnostics.snapshot().windows_captured < windows && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        h.running.store(false, Ordering::Release);
        handle.join().unwrap();
    }

    #[test]
    fn loud_window_is_speech_and_sent() {
        let mut h = harness(256);
        let mut samples = vec![0.5f32; 256];
        samples.extend(vec![0.001f32; 256]);
        run_until_windows(&mut h, &samples, 2);

        let first = h.activity_rx.try_recv().unwrap();
        let second = h.activity_rx.try_recv().unwrap();
        assert!(first.is_speech);
        assert!(!second.is_speech);
        assert!((first.rms - 0.5).abs() < 1e-4);

        let sent = h.outbound.try_recv().unwrap();
        assert_eq!(sent.kind, MediaKind::Audio);
        assert_eq!(sent.blob.mime_type, "audio/pcm;rate=16000");
        let decoded = decode_pcm16(&sent.blob.data, 16_000, 1).unwrap();
        assert_eq!(decoded.frames(), 256);

        // The flag is cleared when the loop ends.
        assert!(!h.user_speaking.load(Ordering::Acquire));
    }

    #[test]
    fn muted_windows_are_analysed_but_not_sent() {
        let mut h = harness(128);
        h.muted.store(true, Ordering::Release);
        run_until_windows(&mut h, &vec![0.3f32; 384], 3);

        assert!(h.outbound.try_recv().is_none());
        let snap = h.diagnostics.snapshot();
        assert_eq!(snap.windows_muted, 3);
        assert_eq!(snap.windows_speech, 3);
        assert!(h.activity_rx.try_recv().unwrap().is_speech);
    }

    #[test]
    fn partial_window_is_held_back() {
        let mut h = harness(4_096);
        let (mic, mut producer) = RingMicrophone::new(16_000);
        producer.push_slice(&vec![0.2f32; 4_000]);
        let ctx = h.ctx.take().unwrap();
        let handle = std::thread::spawn(move || run(Box::new(mic), ctx));
        std::thread::sleep(Duration::from_millis(50));
        h.running.store(false, Ordering::Release);
        handle.join().unwrap();

        assert_eq!(h.diagnostics.snapshot().windows_captured, 0);
        assert!(h.outbound.try_recv().is_none());
    }
}
