//! Lock-free SPSC ring buffer bridging the audio callback to the uplink pump.
//!
//! Uses `ringbuf::HeapRb<f32>` whose wait-free `push_slice` is safe to call
//! from the real-time capture callback. When the ring is full, excess frames
//! are dropped at the producer side — the renderer must never stall.

pub mod chunk;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Producer};

/// Producer half — held by the audio callback thread.
pub type CaptureProducer = ringbuf::HeapProd<f32>;

/// Consumer half — held by the uplink pump thread.
pub type CaptureConsumer = ringbuf::HeapCons<f32>;

/// Capacity: 2^20 = 1 048 576 f32 samples ≈ 21.8 s at 48 kHz.
/// Generous enough to absorb pump stalls (transport backpressure) without
/// dropping speech at the capture boundary.
pub const RING_CAPACITY: usize = 1 << 20;

/// Create a matched producer/consumer pair backed by a heap-allocated ring.
pub fn create_capture_ring() -> (CaptureProducer, CaptureConsumer) {
    HeapRb::<f32>::new(RING_CAPACITY).split()
}
