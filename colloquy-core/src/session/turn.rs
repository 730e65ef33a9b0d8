//! Transcript-synchronized segmentation of one conversational turn.
//!
//! ## Why split points exist
//!
//! The service emits model transcript text *behind* the audio that produced
//! it. Line boundaries therefore have to be recovered retroactively: when a
//! transcript delta brings the running newline count to N, all audio
//! received so far belongs to the lines ending at or before newline N. The
//! synchronizer records the current accumulated sample total as a split
//! point for each new newline, and slices the merged turn audio at those
//! offsets once the turn completes.
//!
//! Callers must feed a message's audio **before** its transcript deltas
//! (the wire decoder guarantees that order) so a split point recorded for a
//! delta reflects the most current total.

use tracing::debug;

use crate::audio::codec;
use crate::buffering::chunk::AudioChunk;
use crate::transport::{CAPTURE_SAMPLE_RATE, MODEL_AUDIO_SAMPLE_RATE};

/// Everything a finished turn hands to the caller.
#[derive(Debug, Clone)]
pub struct TurnOutput {
    pub input_text: String,
    pub output_text: String,
    /// Silence-trimmed user capture; `None` when nothing audible remains.
    pub user_audio: Option<AudioChunk>,
    /// The turn's model audio sliced at transcript line boundaries, in
    /// order. Concatenation equals the turn's full model audio.
    pub model_lines: Vec<AudioChunk>,
}

/// Accumulates exactly one turn at a time. At most one turn accumulates
/// audio/transcript; `complete()` and `reset()` start the next one.
#[derive(Debug, Default)]
pub struct TurnSynchronizer {
    input_text: String,
    output_text: String,
    /// Newlines seen in `output_text` so far.
    newline_count: usize,
    model_chunks: Vec<AudioChunk>,
    /// Running total of model samples; split points index into this.
    total_model_samples: usize,
    /// Sample offsets of transcript line boundaries, in recording order.
    split_points: Vec<usize>,
    user_chunks: Vec<AudioChunk>,
}

impl TurnSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one model audio chunk. Must be called before any transcript
    /// delta that arrived in the same transport message.
    pub fn on_model_audio(&mut self, samples: Vec<i16>) {
        self.total_model_samples += samples.len();
        self.model_chunks
            .push(AudioChunk::new(samples, MODEL_AUDIO_SAMPLE_RATE));
    }

    /// Append one chunk of the user's captured audio (16 kHz).
    pub fn on_user_audio(&mut self, samples: &[i16]) {
        self.user_chunks
            .push(AudioChunk::new(samples.to_vec(), CAPTURE_SAMPLE_RATE));
    }

    pub fn on_input_delta(&mut self, delta: &str) {
        self.input_text.push_str(delta);
    }

    /// Append a model transcript delta and record one split point — at the
    /// current sample total — per newline the delta introduces.
    pub fn on_output_delta(&mut self, delta: &str) {
        self.output_text.push_str(delta);

        let newlines_now = self.output_text.matches('\n').count();
        for _ in self.newline_count..newlines_now {
            self.split_points.push(self.total_model_samples);
        }
        if newlines_now > self.newline_count {
            debug!(
                split_at = self.total_model_samples,
                total_splits = self.split_points.len(),
                "recorded transcript line boundary"
            );
        }
        self.newline_count = newlines_now;
    }

    /// The model was cut off mid-utterance: discard the model side of the
    /// turn (audio, output text, split points). The user's completed input
    /// is still valid and survives.
    pub fn on_interrupted(&mut self) {
        debug!(
            dropped_samples = self.total_model_samples,
            dropped_text = self.output_text.len(),
            "interrupted — discarding model side of turn"
        );
        self.model_chunks.clear();
        self.total_model_samples = 0;
        self.output_text.clear();
        self.newline_count = 0;
        self.split_points.clear();
    }

    /// Finish the turn: merge, slice at split points, trim the user audio,
    /// and reset for the next turn.
    pub fn complete(&mut self) -> TurnOutput {
        let merged = codec::merge_chunks(&self.model_chunks, MODEL_AUDIO_SAMPLE_RATE);

        // Sort, dedup, keep strictly inside (0, total).
        let mut splits = std::mem::take(&mut self.split_points);
        splits.sort_unstable();
        splits.dedup();
        splits.retain(|&p| p > 0 && p < merged.len());

        let mut model_lines = Vec::with_capacity(splits.len() + 1);
        let mut cursor = 0usize;
        for split in splits {
            model_lines.push(AudioChunk::new(
                merged.samples[cursor..split].to_vec(),
                MODEL_AUDIO_SAMPLE_RATE,
            ));
            cursor = split;
        }
        if cursor < merged.len() {
            // Trailing remainder, or the whole buffer when no splits exist.
            model_lines.push(AudioChunk::new(
                merged.samples[cursor..].to_vec(),
                MODEL_AUDIO_SAMPLE_RATE,
            ));
        }

        let user_merged = codec::merge_chunks(&self.user_chunks, CAPTURE_SAMPLE_RATE);
        let user_audio = if user_merged.is_empty() {
            None
        } else {
            let trimmed = codec::trim_silence(&user_merged);
            (!trimmed.is_empty()).then_some(trimmed)
        };

        let output = TurnOutput {
            input_text: std::mem::take(&mut self.input_text),
            output_text: std::mem::take(&mut self.output_text),
            user_audio,
            model_lines,
        };

        self.reset();
        output
    }

    /// Clear all accumulators (both sides).
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Model samples accumulated so far this turn.
    pub fn total_model_samples(&self) -> usize {
        self.total_model_samples
    }
}
