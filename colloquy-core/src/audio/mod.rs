//! Audio capture via the cpal backend.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It **must not**:
//! - Allocate heap memory (after the one-time mix buffer warm-up)
//! - Block on a mutex or condvar
//! - Perform I/O
//!
//! The callback therefore only downmixes to mono f32 and writes into the
//! SPSC ring producer, whose `push_slice` is lock-free. If the ring is full
//! the excess frames are dropped — capture never stalls the render thread.
//! Everything else (resampling to 16 kHz, i16 conversion, base64 framing)
//! happens on the uplink pump thread.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). `AudioCapture` must be created and dropped on the same thread;
//! the session accomplishes this inside `spawn_blocking`.

pub mod codec;
pub mod playback;
pub mod resample;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    SampleFormat, SampleRate, Stream, StreamConfig,
};

#[cfg(feature = "audio-cpal")]
use crate::buffering::Producer;
use crate::{
    buffering::CaptureProducer,
    error::{ColloquyError, Result},
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

/// Which microphone path a session should use.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CaptureBackend {
    /// Open the system default input device via cpal.
    #[default]
    Microphone,
    /// No microphone. The uplink pump never starts; embedders that bring
    /// their own audio (and tests) use this.
    Disabled,
}

/// Handle to an active capture stream.
///
/// **Not `Send`** — bound to its creation thread. Create and drop inside the
/// same `spawn_blocking` closure.
pub struct AudioCapture {
    /// Kept alive so the stream is not dropped prematurely.
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    running: Arc<AtomicBool>,
    /// Actual capture sample rate reported by the device (Hz).
    pub sample_rate: u32,
}

impl AudioCapture {
    /// Open the system default microphone and push mono f32 frames into
    /// `producer` until `running` goes false.
    ///
    /// # Errors
    /// - `CaptureUnsupported` when no input device exists or the sample
    ///   format has no capture path.
    /// - `PermissionDenied` when the host reports an access failure.
    /// - `AudioStream` for any other cpal failure.
    #[cfg(feature = "audio-cpal")]
    pub fn open_default(mut producer: CaptureProducer, running: Arc<AtomicBool>) -> Result<Self> {
        use cpal::traits::HostTrait;

        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| ColloquyError::CaptureUnsupported("no input device".into()))?;

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = device
            .default_input_config()
            .map_err(|e| classify_device_error(e.to_string()))?;

        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        info!(sample_rate, channels, "capture config selected");

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let running_f32 = Arc::clone(&running);
        let running_i16 = Arc::clone(&running);

        let stream = match supported.sample_format() {
            SampleFormat::F32 => {
                let ch = channels as usize;
                let mut mix_buf: Vec<f32> = Vec::new();
                device.build_input_stream(
                    &config,
                    move |data: &[f32], _info| {
                        if !running_f32.load(Ordering::Relaxed) {
                            return;
                        }
                        if ch == 1 {
                            let written = producer.push_slice(data);
                            if written < data.len() {
                                warn!("capture ring full: dropped {} frames", data.len() - written);
                            }
                            return;
                        }
                        let frames = data.len() / ch;
                        mix_buf.resize(frames, 0.0);
                        for f in 0..frames {
                            let base = f * ch;
                            let sum: f32 = data[base..base + ch].iter().sum();
                            mix_buf[f] = sum / ch as f32;
                        }
                        let written = producer.push_slice(&mix_buf);
                        if written < mix_buf.len() {
                            warn!("capture ring full: dropped {} frames", mix_buf.len() - written);
                        }
                    },
                    |err| error!("capture stream error: {err}"),
                    None,
                )
            }

            SampleFormat::I16 => {
                let ch = channels as usize;
                let mut mix_buf: Vec<f32> = Vec::new();
                device.build_input_stream(
                    &config,
                    move |data: &[i16], _info| {
                        if !running_i16.load(Ordering::Relaxed) {
                            return;
                        }
                        let frames = data.len() / ch;
                        mix_buf.resize(frames, 0.0);
                        for f in 0..frames {
                            let base = f * ch;
                            let mut sum = 0f32;
                            for c in 0..ch {
                                sum += data[base + c] as f32 / 32_768.0;
                            }
                            mix_buf[f] = sum / ch as f32;
                        }
                        let written = producer.push_slice(&mix_buf);
                        if written < mix_buf.len() {
                            warn!("capture ring full: dropped {} frames", mix_buf.len() - written);
                        }
                    },
                    |err| error!("capture stream error: {err}"),
                    None,
                )
            }

            fmt => {
                return Err(ColloquyError::CaptureUnsupported(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| ColloquyError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| ColloquyError::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            running,
            sample_rate,
        })
    }

    /// Stop: signal the callback to no-op on its next invocation.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

#[cfg(feature = "audio-cpal")]
fn classify_device_error(detail: String) -> ColloquyError {
    let lowered = detail.to_ascii_lowercase();
    if lowered.contains("permission") || lowered.contains("denied") {
        ColloquyError::PermissionDenied(detail)
    } else {
        ColloquyError::CaptureUnsupported(detail)
    }
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl AudioCapture {
    pub fn open_default(_producer: CaptureProducer, _running: Arc<AtomicBool>) -> Result<Self> {
        Err(ColloquyError::CaptureUnsupported(
            "compiled without audio-cpal feature".into(),
        ))
    }
}
