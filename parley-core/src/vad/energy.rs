//! Energy-based VAD using an RMS threshold and an optional hangover counter.
//!
//! ## Algorithm
//!
//! 1. Compute RMS of the window.
//! 2. If RMS > `threshold` → `Speech`, reload the hangover counter.
//! 3. If RMS ≤ `threshold` and hangover remains → `Speech`, decrement.
//! 4. Otherwise → `Silence`.
//!
//! This is a plain energy gate. Loud non-speech noise trips it and quiet
//! speech can slip under it; the threshold is a tuning knob, not a guarantee.

use super::{VadDecision, VoiceActivityDetector};
use crate::buffering::chunk::AudioChunk;

/// Default RMS threshold for a 4096-sample capture window.
pub const DEFAULT_THRESHOLD: f32 = 0.02;

/// Root-mean-square of a sample slice. Empty input is silent.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

#[derive(Debug, Clone)]
pub struct EnergyVad {
    /// RMS level a window must strictly exceed to count as speech.
    threshold: f32,
    /// Quiet windows still reported as speech after real speech ends.
    hangover_windows: u32,
    hangover_counter: u32,
}

impl EnergyVad {
    pub fn new(threshold: f32, hangover_windows: u32) -> Self {
        Self {
            threshold,
            hangover_windows,
            hangover_counter: 0,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

impl Default for EnergyVad {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD, 0)
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn classify(&mut self, chunk: &AudioChunk) -> VadDecision {
        if rms(&chunk.samples) > self.threshold {
            self.hangover_counter = self.hangover_windows;
            VadDecision::Speech
        } else if self.hangover_counter > 0 {
            self.hangover_counter -= 1;
            VadDecision::Speech
        } else {
            VadDecision::Silence
        }
    }

    fn reset(&mut self) {
        self.hangover_counter = 0;
    }
}
