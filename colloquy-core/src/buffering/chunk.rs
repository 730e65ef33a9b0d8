//! Typed audio buffers passed between the capture, turn, and playback stages.

use serde::{Deserialize, Serialize};

/// A contiguous block of mono signed 16-bit PCM at a known sample rate.
///
/// Immutable once produced; ownership passes from producer to the single
/// active consumer. Capture chunks run at 16 kHz, model chunks at 24 kHz.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioChunk {
    pub samples: Vec<i16>,
    /// Sample rate in Hz (16000 for capture, 24000 for model audio).
    pub sample_rate: u32,
}

impl AudioChunk {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration of this chunk in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Decoded model audio ready for the playback scheduler.
///
/// Normalized f32 samples per channel, all channels the same length.
#[derive(Debug, Clone)]
pub struct PlayableBuffer {
    /// One `Vec<f32>` per channel, samples in [-1.0, 1.0].
    pub channels: Vec<Vec<f32>>,
    pub sample_rate: u32,
}

impl PlayableBuffer {
    /// Frame count (samples per channel).
    pub fn frames(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }
}
