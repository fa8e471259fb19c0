//! Microphone capture via the cpal backend.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It **must not** allocate per call, block on a lock, or perform I/O. It
//! downmixes to mono into a reused scratch buffer and pushes into an SPSC
//! ring producer whose `push_slice` is lock-free.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). `AudioCapture` therefore must be created and dropped on the same
//! thread; the capture loop opens it inside its own `spawn_blocking` closure.

pub mod device;
pub mod output;
pub mod resample;
pub mod wav;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig,
};

use crate::{
    buffering::{create_audio_ring, AudioConsumer, AudioProducer, Consumer, Producer},
    error::{ParleyError, Result},
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{error, info, warn};

/// A live source of mono f32 microphone samples.
///
/// Not required to be `Send`: implementations backed by a host stream live
/// and die on the capture thread.
pub trait MicrophoneStream {
    /// Native rate of the samples returned by `read`.
    fn sample_rate(&self) -> u32;

    /// Copy up to `out.len()` buffered samples into `out`; returns the count.
    /// Returns 0 when nothing is buffered yet.
    fn read(&mut self, out: &mut [f32]) -> usize;

    /// Release the device. Further reads return 0.
    fn stop(&mut self);
}

/// Handle to an active microphone stream.
///
/// **Not `Send`**: `cpal::Stream` is bound to its creation thread on Windows/macOS.
pub struct AudioCapture {
    /// Kept alive so the stream is not dropped prematurely.
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    /// Shared flag: set to `false` to make the callback no-op.
    running: Arc<AtomicBool>,
    /// Actual capture sample rate reported by the device (Hz).
    pub sample_rate: u32,
}

impl AudioCapture {
    /// Open an input device by preferred name, otherwise fall back to the
    /// default input device and then the first available device.
    #[cfg(feature = "audio-cpal")]
    pub fn open_with_preference(
        producer: AudioProducer,
        running: Arc<AtomicBool>,
        preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        use cpal::traits::HostTrait;

        let host = cpal::default_host();
        let mut selected_device = None;

        if let Some(preferred_name) = preferred_device_name {
            match host.input_devices() {
                Ok(mut devices) => {
                    selected_device = devices.find(|device| {
                        device
                            .name()
                            .map(|name| name == preferred_name)
                            .unwrap_or(false)
                    });
                    if selected_device.is_none() {
                        warn!(
                            "preferred input device '{}' not found, falling back",
                            preferred_name
                        );
                    }
                }
                Err(e) => {
                    warn!("failed to list input devices while resolving preference: {e}");
                }
            }
        }

        let device = if let Some(device) = selected_device {
            device
        } else if let Some(default) = host.default_input_device() {
            default
        } else {
            let mut devices = host
                .input_devices()
                .map_err(|e| ParleyError::from_device_failure("microphone", e.to_string()))?;
            let fallback = devices.next().ok_or(ParleyError::NoDefaultInputDevice)?;
            warn!("no default input device, falling back to first available input");
            fallback
        };

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = device
            .default_input_config()
            .map_err(|e| ParleyError::from_device_failure("microphone", e.to_string()))?;

        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        info!(sample_rate, channels, "microphone config selected");

        let config: StreamConfig = supported.config();

        let stream = match supported.sample_format() {
            SampleFormat::F32 => {
                build_capture_stream::<f32>(&device, &config, producer, Arc::clone(&running))
            }
            SampleFormat::I16 => {
                build_capture_stream::<i16>(&device, &config, producer, Arc::clone(&running))
            }
            SampleFormat::U16 => {
                build_capture_stream::<u16>(&device, &config, producer, Arc::clone(&running))
            }
            SampleFormat::U8 => {
                build_capture_stream::<u8>(&device, &config, producer, Arc::clone(&running))
            }
            fmt => {
                return Err(ParleyError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }?;

        stream
            .play()
            .map_err(|e| ParleyError::from_device_failure("microphone", e.to_string()))?;

        Ok(Self {
            _stream: stream,
            running,
            sample_rate,
        })
    }

    /// Stop: signal the callback to no-op on its next invocation.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Frames downmixed per pass inside one input callback.
#[cfg(feature = "audio-cpal")]
const DOWNMIX_BLOCK: usize = 4096;

#[cfg(feature = "audio-cpal")]
fn build_capture_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: AudioProducer,
    running: Arc<AtomicBool>,
) -> Result<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let ch = config.channels.max(1) as usize;
    let mut mono = vec![0.0f32; DOWNMIX_BLOCK];

    device
        .build_input_stream(
            config,
            move |data: &[T], _info| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                for block in data.chunks(DOWNMIX_BLOCK * ch) {
                    let frames = block.len() / ch;
                    let out = &mut mono[..frames];
                    for (dst, frame) in out.iter_mut().zip(block.chunks_exact(ch)) {
                        let sum: f32 = frame.iter().map(|s| f32::from_sample(*s)).sum();
                        *dst = sum / ch as f32;
                    }
                    let written = producer.push_slice(out);
                    if written < frames {
                        warn!("capture ring full: dropped {} frames", frames - written);
                    }
                }
            },
            |err| error!("microphone stream error: {err}"),
            None,
        )
        .map_err(|e| ParleyError::from_device_failure("microphone", e.to_string()))
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl AudioCapture {
    pub fn open_with_preference(
        _producer: AudioProducer,
        _running: Arc<AtomicBool>,
        _preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        Err(ParleyError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

/// `MicrophoneStream` over a cpal capture and its ring consumer.
pub struct CpalMicrophone {
    capture: AudioCapture,
    consumer: AudioConsumer,
    stopped: bool,
}

impl CpalMicrophone {
    /// Open the microphone. Must be called on the thread that will drop it.
    pub fn open(preferred_device_name: Option<&str>) -> Result<Self> {
        let (producer, consumer) = create_audio_ring();
        let running = Arc::new(AtomicBool::new(true));
        let capture = AudioCapture::open_with_preference(producer, running, preferred_device_name)?;
        Ok(Self {
            capture,
            consumer,
            stopped: false,
        })
    }
}

impl MicrophoneStream for CpalMicrophone {
    fn sample_rate(&self) -> u32 {
        self.capture.sample_rate
    }

    fn read(&mut self, out: &mut [f32]) -> usize {
        if self.stopped {
            return 0;
        }
        self.consumer.pop_slice(out)
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.capture.stop();
            self.stopped = true;
            info!("microphone released");
        }
    }
}

/// `MicrophoneStream` fed from an in-memory ring; useful for replaying
/// recorded audio through the capture loop.
pub struct RingMicrophone {
    consumer: AudioConsumer,
    sample_rate: u32,
    stopped: Arc<AtomicBool>,
}

impl RingMicrophone {
    /// Returns the microphone plus the producer that feeds it.
    pub fn new(sample_rate: u32) -> (Self, AudioProducer) {
        let (producer, consumer) = create_audio_ring();
        (
            Self {
                consumer,
                sample_rate,
                stopped: Arc::new(AtomicBool::new(false)),
            },
            producer,
        )
    }

    /// Flag that turns `true` once `stop` has been called.
    pub fn stopped_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stopped)
    }
}

impl MicrophoneStream for RingMicrophone {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read(&mut self, out: &mut [f32]) -> usize {
        if self.stopped.load(Ordering::Acquire) {
            return 0;
        }
        self.consumer.pop_slice(out)
    }

    fn stop(&mut self) {
        self.stopped.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_microphone_reads_what_was_pushed() {
        let (mut mic, mut producer) = RingMicrophone::new(16_000);
        producer.push_slice(&[0.1, 0.2, 0.3]);
        let mut buf = [0.0f32; 8];
        assert_eq!(mic.read(&mut buf), 3);
        assert_eq!(&buf[..3], &[0.1, 0.2, 0.3]);
        assert_eq!(mic.sample_rate(), 16_000);
    }

    #[test]
    fn stopped_ring_microphone_yields_nothing() {
        let (mut mic, mut producer) = RingMicrophone::new(16_000);
        let flag = mic.stopped_flag();
        producer.push_slice(&[0.5; 4]);
        mic.stop();
        assert!(flag.load(Ordering::Acquire));
        let mut buf = [0.0f32; 4];
        assert_eq!(mic.read(&mut buf), 0);
    }

    #[cfg(not(feature = "audio-cpal"))]
    #[test]
    fn microphone_is_unavailable_without_a_backend() {
        let err = CpalMicrophone::open(None).err().unwrap();
        assert!(matches!(err, ParleyError::AudioStream(_)));
    }
}
