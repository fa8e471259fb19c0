//! Fixed-size window assembly.
//!
//! The microphone delivers whatever block size the host picks; the session
//! wants uniform windows (4096 samples at 16 kHz ≈ 256 ms). Leftover samples
//! carry over to the next push.

use super::chunk::AudioChunk;

#[derive(Debug)]
pub struct WindowAssembler {
    window_size: usize,
    sample_rate: u32,
    pending: Vec<f32>,
}

impl WindowAssembler {
    pub fn new(window_size: usize, sample_rate: u32) -> Self {
        let window_size = window_size.max(1);
        Self {
            window_size,
            sample_rate,
            pending: Vec::with_capacity(window_size * 2),
        }
    }

    /// Append samples and return every window that is now complete.
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioChunk> {
        self.pending.extend_from_slice(samples);
        let complete = self.pending.len() / self.window_size;
        if complete == 0 {
            return Vec::new();
        }

        let mut windows = Vec::with_capacity(complete);
        for w in self.pending.chunks_exact(self.window_size) {
            windows.push(AudioChunk::new(w.to_vec(), self.sample_rate));
        }
        self.pending.drain(..complete * self.window_size);
        windows
    }

    /// Samples buffered towards the next window.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
