//! Stateless PCM conversions between float samples, 16-bit buffers, raw
//! bytes, and the transport-safe base64 text encoding.
//!
//! Everything here is a pure function; the capture pump and the inbound
//! event loop call these from their own threads without shared state.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;

use crate::buffering::chunk::{AudioChunk, PlayableBuffer};
use crate::error::{ColloquyError, Result};
use crate::transport::wire::OutboundAudioFrame;

/// MIME type attached to every outbound capture frame.
pub const CAPTURE_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// Amplitude below which a sample counts as silence for [`trim_silence`].
/// 327 ≈ 1 % of i16 full scale, comfortably above mic self-noise but well
/// under the quietest voiced speech.
pub const SILENCE_AMPLITUDE: i16 = 327;

/// A leading/trailing silent run shorter than this survives trimming, so
/// short pauses right at the utterance edges are not clipped.
pub const MIN_SILENCE_RUN_MS: u32 = 100;

/// Convert one normalized float sample to i16 using the standard asymmetric
/// PCM scaling: negative × 32768, positive × 32767. Avoids overflow at +1.0.
#[inline]
pub fn f32_to_i16(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    if clamped < 0.0 {
        (clamped * 32_768.0) as i16
    } else {
        (clamped * 32_767.0) as i16
    }
}

/// Convert a float buffer to i16 PCM, clamping each sample to [-1, 1].
pub fn pcm_from_f32(samples: &[f32]) -> Vec<i16> {
    samples.iter().copied().map(f32_to_i16).collect()
}

/// Serialize i16 PCM as little-endian bytes.
pub fn pcm_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    bytes
}

/// Reinterpret little-endian bytes as i16 PCM.
///
/// # Errors
/// `ColloquyError::Decode` when the byte length is odd.
pub fn bytes_to_pcm(bytes: &[u8]) -> Result<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        return Err(ColloquyError::Decode(format!(
            "odd PCM byte length: {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect())
}

/// Encode one capture quantum as an outbound transport frame
/// (base64 of raw 16-bit little-endian PCM at 16 kHz).
pub fn encode_audio_frame(samples: &[i16]) -> OutboundAudioFrame {
    OutboundAudioFrame {
        data: B64.encode(pcm_to_bytes(samples)),
        mime_type: CAPTURE_MIME_TYPE.to_string(),
    }
}

/// Decode raw model-audio bytes into a playable buffer.
///
/// Frame count = `bytes.len() / 2 / channels`; each i16 sample is divided by
/// 32768 to produce normalized floats, de-interleaved per channel.
///
/// # Errors
/// `ColloquyError::Decode` on odd byte length or zero channels.
pub fn decode_model_audio(
    bytes: &[u8],
    sample_rate: u32,
    channels: usize,
) -> Result<PlayableBuffer> {
    if channels == 0 {
        return Err(ColloquyError::Decode("zero channels".into()));
    }
    let pcm = bytes_to_pcm(bytes)?;
    let frames = pcm.len() / channels;

    let mut out = vec![Vec::with_capacity(frames); channels];
    for frame in pcm.chunks_exact(channels) {
        for (ch, sample) in frame.iter().enumerate() {
            out[ch].push(*sample as f32 / 32_768.0);
        }
    }

    Ok(PlayableBuffer {
        channels: out,
        sample_rate,
    })
}

/// Concatenate chunks in order. Empty input yields a zero-length chunk at
/// `sample_rate`.
pub fn merge_chunks(chunks: &[AudioChunk], sample_rate: u32) -> AudioChunk {
    let total: usize = chunks.iter().map(AudioChunk::len).sum();
    let mut samples = Vec::with_capacity(total);
    for chunk in chunks {
        samples.extend_from_slice(&chunk.samples);
    }
    AudioChunk::new(samples, sample_rate)
}

/// Remove leading and trailing near-zero runs without touching pauses
/// internal to speech.
///
/// A run is stripped only when every sample stays below
/// [`SILENCE_AMPLITUDE`] *and* the run lasts at least [`MIN_SILENCE_RUN_MS`].
/// Idempotent: trimming a trimmed chunk is a no-op.
pub fn trim_silence(chunk: &AudioChunk) -> AudioChunk {
    let min_run = (chunk.sample_rate as usize * MIN_SILENCE_RUN_MS as usize) / 1000;
    let samples = &chunk.samples;

    let first_loud = samples
        .iter()
        .position(|s| s.unsigned_abs() > SILENCE_AMPLITUDE as u16);

    let Some(first_loud) = first_loud else {
        // Entirely silent: a long run trims to nothing, a short one survives.
        if samples.len() >= min_run {
            return AudioChunk::new(Vec::new(), chunk.sample_rate);
        }
        return chunk.clone();
    };

    let last_loud = samples
        .iter()
        .rposition(|s| s.unsigned_abs() > SILENCE_AMPLITUDE as u16)
        .unwrap_or(first_loud);

    let start = if first_loud >= min_run { first_loud } else { 0 };
    let trailing_run = samples.len() - 1 - last_loud;
    let end = if trailing_run >= min_run {
        last_loud + 1
    } else {
        samples.len()
    };

    AudioChunk::new(samples[start..end].to_vec(), chunk.sample_rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asymmetric_scaling_hits_full_range_without_overflow() {
        assert_eq!(f32_to_i16(-1.0), i16::MIN);
        assert_eq!(f32_to_i16(1.0), i16::MAX);
        assert_eq!(f32_to_i16(0.0), 0);
        // Out-of-range input is clamped, not wrapped.
        assert_eq!(f32_to_i16(2.0), i16::MAX);
        assert_eq!(f32_to_i16(-2.0), i16::MIN);
    }

    #[test]
    fn pcm_bytes_round_trip_little_endian() {
        let pcm = vec![0i16, -1, 1, i16::MIN, i16::MAX];
        let bytes = pcm_to_bytes(&pcm);
        assert_eq!(bytes.len(), pcm.len() * 2);
        assert_eq!(bytes_to_pcm(&bytes).unwrap(), pcm);
    }

    #[test]
    fn odd_byte_length_is_a_decode_error() {
        let err = bytes_to_pcm(&[0u8, 1, 2]).unwrap_err();
        assert!(matches!(err, ColloquyError::Decode(_)));
    }

    #[test]
    fn encode_frame_carries_capture_mime_type() {
        let frame = encode_audio_frame(&[100, -100]);
        assert_eq!(frame.mime_type, CAPTURE_MIME_TYPE);
        let bytes = B64.decode(&frame.data).unwrap();
        assert_eq!(bytes_to_pcm(&bytes).unwrap(), vec![100, -100]);
    }

    #[test]
    fn decode_model_audio_normalizes_and_deinterleaves() {
        // Two stereo frames: (16384, -16384), (0, 32767)
        let pcm = vec![16_384i16, -16_384, 0, 32_767];
        let buf = decode_model_audio(&pcm_to_bytes(&pcm), 24_000, 2).unwrap();
        assert_eq!(buf.frames(), 2);
        assert!((buf.channels[0][0] - 0.5).abs() < 1e-6);
        assert!((buf.channels[1][0] + 0.5).abs() < 1e-6);
        assert_eq!(buf.channels[0][1], 0.0);
    }

    #[test]
    fn decode_model_audio_rejects_zero_channels() {
        assert!(decode_model_audio(&[0, 0], 24_000, 0).is_err());
    }

    #[test]
    fn merge_preserves_order_and_handles_empty() {
        let a = AudioChunk::new(vec![1, 2], 24_000);
        let b = AudioChunk::new(vec![3], 24_000);
        let merged = merge_chunks(&[a, b], 24_000);
        assert_eq!(merged.samples, vec![1, 2, 3]);

        let empty = merge_chunks(&[], 24_000);
        assert!(empty.is_empty());
        assert_eq!(empty.sample_rate, 24_000);
    }

    fn chunk_16k(samples: Vec<i16>) -> AudioChunk {
        AudioChunk::new(samples, 16_000)
    }

    #[test]
    fn trims_long_leading_and_trailing_silence() {
        // 200 ms silence + speech + 200 ms silence at 16 kHz
        let mut samples = vec![0i16; 3200];
        samples.extend(vec![5000i16; 800]);
        samples.extend(vec![0i16; 3200]);
        let trimmed = trim_silence(&chunk_16k(samples));
        assert_eq!(trimmed.samples, vec![5000i16; 800]);
    }

    #[test]
    fn short_edge_silence_survives() {
        // 50 ms leading silence < MIN_SILENCE_RUN_MS — kept.
        let mut samples = vec![0i16; 800];
        samples.extend(vec![5000i16; 800]);
        let chunk = chunk_16k(samples.clone());
        assert_eq!(trim_silence(&chunk).samples, samples);
    }

    #[test]
    fn interior_pauses_are_never_removed() {
        let mut samples = vec![5000i16; 400];
        samples.extend(vec![0i16; 4800]); // 300 ms pause inside speech
        samples.extend(vec![5000i16; 400]);
        let chunk = chunk_16k(samples.clone());
        assert_eq!(trim_silence(&chunk).samples, samples);
    }

    #[test]
    fn trim_is_idempotent() {
        let mut samples = vec![0i16; 3200];
        samples.extend(vec![5000i16; 160]);
        samples.extend(vec![200i16; 40]); // short quiet tail below threshold
        let once = trim_silence(&chunk_16k(samples));
        let twice = trim_silence(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn fully_silent_long_chunk_trims_to_empty() {
        let trimmed = trim_silence(&chunk_16k(vec![0i16; 16_000]));
        assert!(trimmed.is_empty());
        assert_eq!(trim_silence(&trimmed), trimmed);
    }
}
