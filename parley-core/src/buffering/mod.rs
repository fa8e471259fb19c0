//! Lock-free SPSC ring buffer between the microphone callback and the
//! capture loop, plus the fixed-window assembler the loop feeds.
//!
//! `ringbuf::HeapRb<f32>` gives a wait-free `push_slice` that is safe to call
//! from the real-time audio callback.

pub mod chunk;
pub mod window;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Producer};

/// Producer half, held by the microphone callback thread.
pub type AudioProducer = ringbuf::HeapProd<f32>;

/// Consumer half, held by the capture loop.
pub type AudioConsumer = ringbuf::HeapCons<f32>;

/// Buffer capacity: 2^20 = 1 048 576 f32 samples ≈ 21.8 s at 48 kHz.
/// The capture loop drains every few milliseconds, so this only absorbs
/// scheduler hiccups.
pub const RING_CAPACITY: usize = 1 << 20;

/// Create a matched producer/consumer pair backed by a heap-allocated ring buffer.
pub fn create_audio_ring() -> (AudioProducer, AudioConsumer) {
    HeapRb::<f32>::new(RING_CAPACITY).split()
}
