//! Sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! Two directions need it: microphones usually run at 44.1/48 kHz while the
//! session wants 16 kHz, and model speech arrives at 24 kHz while the output
//! device may only offer 48 kHz. Both conversions run off the audio callbacks.
//!
//! When the rates already match, `RateConverter` is a passthrough and no
//! rubato session is created.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::error;

use crate::error::{ParleyError, Result};

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` when input rate == output rate (passthrough mode).
    resampler: Option<FastFixedIn<f32>>,
    /// Partial input carried between calls.
    input_buf: Vec<f32>,
    /// Input samples rubato expects per process call.
    chunk_size: usize,
    /// Pre-allocated output buffer: `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
    ratio: f64,
}

impl RateConverter {
    /// # Errors
    /// Returns `ParleyError::AudioDevice` if rubato fails to initialise.
    pub fn new(input_rate: u32, output_rate: u32, chunk_size: usize) -> Result<Self> {
        let ratio = output_rate as f64 / input_rate.max(1) as f64;
        if input_rate == output_rate {
            return Ok(Self {
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
                ratio,
            });
        }

        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0,
            PolynomialDegree::Cubic,
            chunk_size,
            1,
        )
        .map_err(|e| ParleyError::AudioDevice(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        let output_buf = vec![vec![0f32; max_out]; 1];

        tracing::debug!(input_rate, output_rate, chunk_size, "resampler ready");

        Ok(Self {
            resampler: Some(resampler),
            input_buf: Vec::new(),
            chunk_size,
            output_buf,
            ratio,
        })
    }

    /// Process incoming samples, returning resampled output (may be empty).
    ///
    /// Samples accumulate internally until a full `chunk_size` block is
    /// available; any remainder is kept for the next call.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.input_buf.extend_from_slice(samples);
        let mut result = Vec::new();

        while self.input_buf.len() >= self.chunk_size {
            let input_slice = &self.input_buf[..self.chunk_size];
            match resampler.process_into_buffer(&[input_slice], &mut self.output_buf, None) {
                Ok((_consumed, produced)) => {
                    result.extend_from_slice(&self.output_buf[0][..produced]);
                }
                Err(e) => {
                    error!("resampler process error: {e}");
                }
            }
            self.input_buf.drain(..self.chunk_size);
        }

        result
    }

    /// Convert a complete clip, flushing the tail with silence and trimming
    /// the result to the clip's exact converted length. The resampler's
    /// output delay is skipped, so sample 0 of the result lines up with
    /// sample 0 of the clip.
    pub fn convert_whole(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(delay) = self.resampler.as_ref().map(|r| r.output_delay()) else {
            return samples.to_vec();
        };
        let expected = (samples.len() as f64 * self.ratio).round() as usize;
        let mut out = self.process(samples);
        let pad = self.chunk_size - self.input_buf.len() % self.chunk_size;
        // Two extra blocks push rubato's internal delay line through.
        let flush = vec![0.0f32; pad + self.chunk_size * 2];
        out.extend(self.process(&flush));
        out.drain(..delay.min(out.len()));
        out.resize(expected, 0.0);
        self.input_buf.clear();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
        out
    }

    /// Returns `true` when input rate == output rate.
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}
