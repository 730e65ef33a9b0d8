//! Sample-rate conversion for the capture uplink.
//!
//! Devices report their own rate (48 kHz is typical); the service wants
//! 16 kHz mono. The converter runs on the uplink pump thread, where
//! allocation is fine. Matching rates short-circuit to a copy.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{error, info};

use crate::error::{ColloquyError, Result};

/// Fixed-ratio f32 mono rate converter built on rubato's `FastFixedIn`.
///
/// rubato consumes fixed-size input blocks, so incoming audio of arbitrary
/// length is split into full blocks processed straight from the caller's
/// slice; a sub-block tail is carried over to the next call. [`flush`]
/// drains the carry at end of stream.
///
/// [`flush`]: RateConverter::flush
pub struct RateConverter {
    inner: Option<FastFixedIn<f32>>,
    chunk: usize,
    /// Tail samples shorter than one rubato block, kept between calls.
    carry: Vec<f32>,
    scratch: Vec<Vec<f32>>,
}

impl RateConverter {
    /// `chunk` is the rubato input block size in frames.
    ///
    /// # Errors
    /// `ColloquyError::AudioStream` when rubato rejects the rate ratio.
    pub fn new(source_rate: u32, target_rate: u32, chunk: usize) -> Result<Self> {
        if source_rate == target_rate {
            return Ok(Self {
                inner: None,
                chunk,
                carry: Vec::new(),
                scratch: Vec::new(),
            });
        }

        let inner = FastFixedIn::<f32>::new(
            target_rate as f64 / source_rate as f64,
            1.0,
            PolynomialDegree::Cubic,
            chunk,
            1,
        )
        .map_err(|e| ColloquyError::AudioStream(format!("resampler init: {e}")))?;

        info!(source_rate, target_rate, chunk, "uplink rate conversion enabled");
        let scratch = vec![vec![0f32; inner.output_frames_max()]];

        Ok(Self {
            inner: Some(inner),
            chunk,
            carry: Vec::with_capacity(chunk),
            scratch,
        })
    }

    /// Convert `input`, appending the produced samples to `out`. Output may
    /// lag input by up to one block while the carry fills.
    pub fn process_into(&mut self, input: &[f32], out: &mut Vec<f32>) {
        if self.inner.is_none() {
            out.extend_from_slice(input);
            return;
        }

        let mut rest = input;

        // Top up a partial carry first.
        if !self.carry.is_empty() {
            let need = self.chunk - self.carry.len();
            let take = need.min(rest.len());
            self.carry.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.carry.len() < self.chunk {
                return;
            }
            let block = std::mem::take(&mut self.carry);
            self.run_block(&block, out);
            self.carry = block;
            self.carry.clear();
        }

        // Full blocks straight from the input slice, no copy.
        while rest.len() >= self.chunk {
            let (block, tail) = rest.split_at(self.chunk);
            self.run_block(block, out);
            rest = tail;
        }

        self.carry.extend_from_slice(rest);
    }

    /// Drain the carried tail, padding to a full block. Call once at end of
    /// stream; the converter is reusable afterwards.
    pub fn flush(&mut self, out: &mut Vec<f32>) {
        if self.inner.is_none() || self.carry.is_empty() {
            return;
        }
        let mut block = std::mem::take(&mut self.carry);
        // The produced length still reflects the real samples plus padding;
        // a short zero tail is inaudible and keeps block math exact.
        block.resize(self.chunk, 0.0);
        self.run_block(&block, out);
    }

    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    fn run_block(&mut self, block: &[f32], out: &mut Vec<f32>) {
        let Some(ref mut inner) = self.inner else {
            return;
        };
        match inner.process_into_buffer(&[block], &mut self.scratch, None) {
            Ok((_consumed, produced)) => out.extend_from_slice(&self.scratch[0][..produced]),
            Err(e) => error!("rate conversion failed, dropping block: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convert(rc: &mut RateConverter, input: &[f32]) -> Vec<f32> {
        let mut out = Vec::new();
        rc.process_into(input, &mut out);
        out
    }

    #[test]
    fn matching_rates_pass_through_unchanged() {
        let mut rc = RateConverter::new(16_000, 16_000, 960).unwrap();
        assert!(rc.is_passthrough());
        let samples: Vec<f32> = (0..480).map(|i| i as f32 * 0.001).collect();
        assert_eq!(convert(&mut rc, &samples), samples);
    }

    #[test]
    fn downsamples_48k_to_16k_at_one_third_length() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).unwrap();
        assert!(!rc.is_passthrough());
        let out = convert(&mut rc, &vec![0.25f32; 960]);
        // 960 frames at 48 kHz ≈ 320 at 16 kHz, modulo filter edges.
        assert!(
            out.len().abs_diff(320) <= 10,
            "unexpected output length {}",
            out.len()
        );
    }

    #[test]
    fn short_input_is_carried_until_a_block_fills() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).unwrap();
        assert!(convert(&mut rc, &vec![0.0f32; 500]).is_empty());
        assert!(!convert(&mut rc, &vec![0.0f32; 500]).is_empty());
    }

    #[test]
    fn flush_drains_the_carried_tail() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).unwrap();
        assert!(convert(&mut rc, &vec![0.5f32; 300]).is_empty());

        let mut out = Vec::new();
        rc.flush(&mut out);
        assert!(!out.is_empty());

        // Flushing again is a no-op.
        let mut again = Vec::new();
        rc.flush(&mut again);
        assert!(again.is_empty());
    }

    #[test]
    fn block_splitting_does_not_lose_samples() {
        // Feed 5 blocks worth in odd-sized pieces and compare against one
        // contiguous pass.
        let signal: Vec<f32> = (0..4800).map(|i| (i as f32 * 0.01).sin()).collect();

        let mut whole = RateConverter::new(48_000, 16_000, 960).unwrap();
        let mut expected = Vec::new();
        whole.process_into(&signal, &mut expected);

        let mut pieces = RateConverter::new(48_000, 16_000, 960).unwrap();
        let mut got = Vec::new();
        for piece in signal.chunks(313) {
            pieces.process_into(piece, &mut got);
        }
        assert_eq!(got, expected);
    }
}
