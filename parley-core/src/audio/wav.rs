//! A microphone that plays back a WAV file at real-time pace.
//!
//! Useful for demos and soak runs on machines without an input device. The
//! file is decoded once with hound and downmixed to mono; `read` then hands
//! out only as many samples as wall-clock time says a real device would have
//! captured by now.

use std::path::Path;
use std::time::Instant;

use hound::{SampleFormat, WavReader};
use tracing::info;

use super::MicrophoneStream;
use crate::error::{ParleyError, Result};

pub struct WavMicrophone {
    samples: Vec<f32>,
    sample_rate: u32,
    pos: usize,
    started: Option<Instant>,
    stopped: bool,
}

impl WavMicrophone {
    pub fn open(path: &Path) -> Result<Self> {
        let reader = WavReader::open(path)
            .map_err(|e| ParleyError::AudioDevice(format!("{}: {e}", path.display())))?;
        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;

        let interleaved: Vec<f32> = match spec.sample_format {
            SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| ParleyError::AudioDevice(e.to_string()))?,
            SampleFormat::Int => {
                let scale = 1.0 / (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 * scale))
                    .collect::<std::result::Result<_, _>>()
                    .map_err(|e| ParleyError::AudioDevice(e.to_string()))?
            }
        };

        let samples: Vec<f32> = interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect();

        info!(
            path = %path.display(),
            sample_rate = spec.sample_rate,
            seconds = samples.len() as f64 / spec.sample_rate as f64,
            "wav microphone opened"
        );

        Ok(Self::from_samples(samples, spec.sample_rate))
    }

    pub fn from_samples(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            pos: 0,
            started: None,
            stopped: false,
        }
    }

    /// `true` once every sample has been read.
    pub fn is_exhausted(&self) -> bool {
        self.pos >= self.samples.len()
    }
}

impl MicrophoneStream for WavMicrophone {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read(&mut self, out: &mut [f32]) -> usize {
        if self.stopped || self.is_exhausted() {
            return 0;
        }
        let started = *self.started.get_or_insert_with(Instant::now);
        let due = (started.elapsed().as_secs_f64() * self.sample_rate as f64) as usize;
        let available = due.min(self.samples.len()).saturating_sub(self.pos);
        let n = available.min(out.len());
        out[..n].copy_from_slice(&self.samples[self.pos..self.pos + n]);
        self.pos += n;
        n
    }

    fn stop(&mut self) {
        self.stopped = true;
    }
}
