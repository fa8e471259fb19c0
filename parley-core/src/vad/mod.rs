//! Voice Activity Detection (VAD) abstraction.
//!
//! The capture loop only needs a speech/silence decision per window; the
//! `VoiceActivityDetector` trait keeps the energy gate swappable.

pub mod energy;

pub use energy::{rms, EnergyVad};

use crate::buffering::chunk::AudioChunk;

/// Whether a given audio window contains speech or silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    /// The window's energy is above threshold (or within hangover).
    Speech,
    /// The window is quiet.
    Silence,
}

impl VadDecision {
    pub fn is_speech(self) -> bool {
        self == VadDecision::Speech
    }
}

/// Trait for all VAD implementations.
///
/// Implementors may be stateful (hangover counters etc.).
pub trait VoiceActivityDetector: Send + 'static {
    /// Analyse a window and return a speech/silence decision.
    fn classify(&mut self, chunk: &AudioChunk) -> VadDecision;

    /// Reset any internal state.
    fn reset(&mut self);
}
