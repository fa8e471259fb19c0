//! Speaker output via cpal.
//!
//! The stream is `!Send`, so a dedicated `parley-output` thread opens it,
//! holds it, and services suspend/resume requests until shutdown. The audio
//! callback owns a [`Mixer`]: it pulls new segments from a channel, sums every
//! voice whose start frame has been reached, and advances a frame counter that
//! doubles as the device clock. Resampling to the device rate happens in
//! `enqueue`, on the caller's thread, never in the callback.
//!
//! The callback does not allocate or free. Channels are bounded (array
//! backed), the voice list and mix buffer are sized up front, and finished or
//! cancelled voices travel back over the finished channel so their sample
//! buffers are dropped by `drain_finished` on the session side.

use std::collections::HashSet;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::resample::RateConverter;
use crate::error::{ParleyError, Result};
use crate::playback::{OutputSink, ScheduledSegment, SegmentId};

const RESAMPLE_CHUNK: usize = 1024;

/// Voices the mixer holds at once. Also the capacity of the add channel.
const MAX_VOICES: usize = 256;

/// Frames mixed per pass inside one callback.
const MIX_BLOCK: usize = 4096;

#[derive(Debug)]
struct Voice {
    id: SegmentId,
    /// Cancel epoch at enqueue time; older voices are dropped on sight.
    epoch: u64,
    start_frame: u64,
    samples: Vec<f32>,
    pos: usize,
}

/// Sums scheduled voices into callback buffers on a shared frame clock.
pub(crate) struct Mixer {
    incoming: Receiver<Voice>,
    /// Finished and cancelled voices go back to the owner to be freed.
    retired: Sender<Voice>,
    clock: Arc<AtomicU64>,
    cancel_epoch: Arc<AtomicU64>,
    voices: Vec<Voice>,
}

impl Mixer {
    fn new(
        incoming: Receiver<Voice>,
        retired: Sender<Voice>,
        clock: Arc<AtomicU64>,
        cancel_epoch: Arc<AtomicU64>,
    ) -> Self {
        Self {
            incoming,
            retired,
            clock,
            cancel_epoch,
            voices: Vec::with_capacity(MAX_VOICES),
        }
    }

    fn retire(retired: &Sender<Voice>, voice: Voice) {
        // Only a full or closed channel drops the voice here.
        let _ = retired.try_send(voice);
    }

    /// Fill `out` (mono) and advance the clock by `out.len()` frames.
    pub(crate) fn render(&mut self, out: &mut [f32]) {
        let epoch = self.cancel_epoch.load(Ordering::Acquire);

        let mut i = 0;
        while i < self.voices.len() {
            if self.voices[i].epoch < epoch {
                let voice = self.voices.swap_remove(i);
                Self::retire(&self.retired, voice);
            } else {
                i += 1;
            }
        }
        while self.voices.len() < self.voices.capacity() {
            let Ok(voice) = self.incoming.try_recv() else {
                break;
            };
            if voice.epoch < epoch {
                Self::retire(&self.retired, voice);
            } else {
                self.voices.push(voice);
            }
        }

        out.fill(0.0);
        let base = self.clock.load(Ordering::Acquire);
        let frames = out.len() as u64;
        let end = base + frames;

        for voice in &mut self.voices {
            if voice.start_frame >= end {
                continue;
            }
            let begin = if voice.pos == 0 {
                voice.start_frame.saturating_sub(base) as usize
            } else {
                0
            };
            let remaining = voice.samples.len() - voice.pos;
            let n = remaining.min(out.len() - begin);
            for (dst, src) in out[begin..begin + n]
                .iter_mut()
                .zip(&voice.samples[voice.pos..voice.pos + n])
            {
                *dst += *src;
            }
            voice.pos += n;
        }

        // Retire in start order so completions are reported in play order.
        loop {
            let next = self
                .voices
                .iter()
                .enumerate()
                .filter(|(_, v)| v.start_frame < end && v.pos >= v.samples.len())
                .min_by_key(|(_, v)| (v.start_frame, v.id.0))
                .map(|(idx, _)| idx);
            let Some(idx) = next else { break };
            let voice = self.voices.remove(idx);
            Self::retire(&self.retired, voice);
        }

        self.clock.fetch_add(frames, Ordering::Release);
    }
}

enum Control {
    Suspend,
    Resume,
    Shutdown,
}

/// The output device context: one cpal stream plus its frame clock.
pub struct CpalOutput {
    sample_rate: u32,
    clock: Arc<AtomicU64>,
    cancel_epoch: Arc<AtomicU64>,
    voice_tx: Sender<Voice>,
    retired_rx: Receiver<Voice>,
    control_tx: Sender<Control>,
    /// Enqueued and not yet reported finished or cancelled.
    pending: Mutex<HashSet<SegmentId>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CpalOutput {
    /// Open the default output device, preferring `preferred_rate` when the
    /// device supports it. Blocks until the stream is built.
    pub fn open(preferred_rate: u32) -> Result<Self> {
        let clock = Arc::new(AtomicU64::new(0));
        let cancel_epoch = Arc::new(AtomicU64::new(0));
        let (voice_tx, voice_rx) = crossbeam_channel::bounded(MAX_VOICES);
        let (retired_tx, retired_rx) = crossbeam_channel::bounded(MAX_VOICES * 2);
        let (control_tx, control_rx) = crossbeam_channel::unbounded::<Control>();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<u32>>(1);

        let mixer = Mixer::new(
            voice_rx,
            retired_tx,
            Arc::clone(&clock),
            Arc::clone(&cancel_epoch),
        );
        let thread = std::thread::Builder::new()
            .name("parley-output".into())
            .spawn(move || {
                let (stream, rate) = match open_stream(preferred_rate, mixer) {
                    Ok(opened) => opened,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(rate));
                serve_controls(&stream, control_rx);
                drop(stream);
                info!("output stream closed");
            })?;

        let sample_rate = ready_rx
            .recv()
            .map_err(|_| ParleyError::AudioStream("output thread exited during open".into()))??;

        Ok(Self {
            sample_rate,
            clock,
            cancel_epoch,
            voice_tx,
            retired_rx,
            control_tx,
            pending: Mutex::new(HashSet::new()),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Queue a control request for the output thread without waiting on it.
    fn request(&self, control: Control) -> Result<()> {
        self.control_tx
            .send(control)
            .map_err(|_| ParleyError::AudioStream("output thread is gone".into()))
    }
}

impl OutputSink for CpalOutput {
    fn current_time(&self) -> f64 {
        self.clock.load(Ordering::Acquire) as f64 / self.sample_rate as f64
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn enqueue(&self, segment: ScheduledSegment) -> Result<()> {
        let mono = segment.audio.to_mono();
        let samples = if segment.audio.sample_rate == self.sample_rate {
            mono
        } else {
            RateConverter::new(segment.audio.sample_rate, self.sample_rate, RESAMPLE_CHUNK)?
                .convert_whole(&mono)
        };
        let start_frame = (segment.start_time.max(0.0) * self.sample_rate as f64).round() as u64;
        let voice = Voice {
            id: segment.id,
            epoch: self.cancel_epoch.load(Ordering::Acquire),
            start_frame,
            samples,
            pos: 0,
        };
        let mut pending = self.pending.lock();
        match self.voice_tx.try_send(voice) {
            Ok(()) => {
                pending.insert(segment.id);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                Err(ParleyError::AudioStream("output voice queue is full".into()))
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(ParleyError::AudioStream("output stream is closed".into()))
            }
        }
    }

    fn cancel_pending(&self) -> Vec<SegmentId> {
        let mut pending = self.pending.lock();
        self.cancel_epoch.fetch_add(1, Ordering::AcqRel);
        pending.drain().collect()
    }

    fn drain_finished(&self) -> Vec<SegmentId> {
        let mut pending = self.pending.lock();
        // Cancelled voices come back here too; they are no longer pending.
        self.retired_rx
            .try_iter()
            .map(|voice| voice.id)
            .filter(|id| pending.remove(id))
            .collect()
    }

    fn reports_completion(&self) -> bool {
        true
    }

    fn suspend(&self) -> Result<()> {
        self.request(Control::Suspend)
    }

    fn resume(&self) -> Result<()> {
        self.request(Control::Resume)
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        let _ = self.control_tx.send(Control::Shutdown);
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                warn!("output thread panicked");
            }
        }
    }
}

#[cfg(feature = "audio-cpal")]
fn serve_controls(stream: &cpal::Stream, controls: Receiver<Control>) {
    use cpal::traits::StreamTrait;

    for cmd in controls.iter() {
        match cmd {
            Control::Suspend => match stream.pause() {
                Ok(()) => debug!("output suspended"),
                Err(e) => warn!("failed to suspend output: {e}"),
            },
            Control::Resume => match stream.play() {
                Ok(()) => debug!("output resumed"),
                Err(e) => warn!("failed to resume output: {e}"),
            },
            Control::Shutdown => break,
        }
    }
}

#[cfg(feature = "audio-cpal")]
fn open_stream(preferred_rate: u32, mixer: Mixer) -> Result<(cpal::Stream, u32)> {
    use cpal::{
        traits::{DeviceTrait, HostTrait, StreamTrait},
        SampleFormat,
    };

    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(ParleyError::NoDefaultOutputDevice)?;
    info!(
        device = device.name().unwrap_or_default().as_str(),
        "opening output device"
    );

    let supported = pick_output_config(&device, preferred_rate)?;
    let rate = supported.sample_rate().0;
    let config: cpal::StreamConfig = supported.config();
    info!(rate, channels = config.channels, "output config selected");

    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_output_stream::<f32>(&device, &config, mixer),
        SampleFormat::I16 => build_output_stream::<i16>(&device, &config, mixer),
        SampleFormat::U16 => build_output_stream::<u16>(&device, &config, mixer),
        fmt => {
            return Err(ParleyError::AudioStream(format!(
                "unsupported sample format: {fmt:?}"
            )))
        }
    }?;

    stream
        .play()
        .map_err(|e| ParleyError::AudioStream(e.to_string()))?;
    Ok((stream, rate))
}

/// The device default, switched to `preferred_rate` if some supported range
/// with the same sample format covers it.
#[cfg(feature = "audio-cpal")]
fn pick_output_config(
    device: &cpal::Device,
    preferred_rate: u32,
) -> Result<cpal::SupportedStreamConfig> {
    use cpal::traits::DeviceTrait;

    let default = device
        .default_output_config()
        .map_err(|e| ParleyError::AudioDevice(e.to_string()))?;
    if default.sample_rate().0 == preferred_rate {
        return Ok(default);
    }
    if let Ok(ranges) = device.supported_output_configs() {
        for range in ranges {
            if range.sample_format() == default.sample_format()
                && range.channels() == default.channels()
                && range.min_sample_rate().0 <= preferred_rate
                && preferred_rate <= range.max_sample_rate().0
            {
                return Ok(range.with_sample_rate(cpal::SampleRate(preferred_rate)));
            }
        }
    }
    debug!(
        preferred_rate,
        device_rate = default.sample_rate().0,
        "preferred output rate unsupported, resampling"
    );
    Ok(default)
}

#[cfg(feature = "audio-cpal")]
fn build_output_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut mixer: Mixer,
) -> Result<cpal::Stream>
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    use cpal::traits::DeviceTrait;

    let ch = config.channels.max(1) as usize;
    let mut mono = vec![0.0f32; MIX_BLOCK];

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _info| {
                for block in data.chunks_mut(MIX_BLOCK * ch) {
                    let frames = block.len() / ch;
                    let mix = &mut mono[..frames];
                    mixer.render(mix);
                    for (frame, s) in block.chunks_exact_mut(ch).zip(mix.iter()) {
                        let v = T::from_sample(s.clamp(-1.0, 1.0));
                        frame.fill(v);
                    }
                }
            },
            |err| tracing::error!("speaker stream error: {err}"),
            None,
        )
        .map_err(|e| ParleyError::AudioStream(e.to_string()))
}

/// Stand-in for the stream type when cpal is compiled out.
#[cfg(not(feature = "audio-cpal"))]
struct NoStream;

#[cfg(not(feature = "audio-cpal"))]
fn open_stream(_preferred_rate: u32, _mixer: Mixer) -> Result<(NoStream, u32)> {
    Err(ParleyError::AudioStream(
        "compiled without audio-cpal feature".into(),
    ))
}

#[cfg(not(feature = "audio-cpal"))]
fn serve_controls(_stream: &NoStream, _controls: Receiver<Control>) {}
