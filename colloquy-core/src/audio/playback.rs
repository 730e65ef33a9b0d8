//! Gapless playback scheduling for model audio.
//!
//! ## Algorithm
//!
//! The scheduler keeps a single monotonically advancing "next start time"
//! cursor on the playback clock. Each decoded buffer is scheduled at
//! `max(cursor, now)` and the cursor advances by the buffer's duration, so
//! chunks play back-to-back even when they arrive in bursts, and the cursor
//! self-corrects when playback falls behind the arrival rate.
//!
//! `stop_all()` halts every tracked source and resets the cursor to zero.
//! The session calls it synchronously on `Interrupted` and during teardown.
//!
//! The clock and the sink are seams: tests drive a `ManualClock` + `NullSink`;
//! real playback uses `CpalSink`, which mixes scheduled sources inside the
//! cpal output callback.

use std::time::Instant;

use tracing::debug;

use crate::buffering::chunk::PlayableBuffer;

/// Monotonic playback clock in seconds.
pub trait PlaybackClock: Send + 'static {
    fn now(&self) -> f64;
}

/// Default clock: seconds since scheduler construction.
pub struct WallClock {
    origin: Instant,
}

impl WallClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackClock for WallClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Where scheduled buffers actually go.
pub trait PlaybackSink: Send + 'static {
    /// Begin playing `buf` at `start` seconds on the playback clock.
    fn play_at(&mut self, source_id: u64, buf: &PlayableBuffer, start: f64);

    /// Immediately halt every playing and pending source.
    fn stop_all(&mut self);
}

/// Discards audio. For headless embedders and tests.
#[derive(Debug, Default)]
pub struct NullSink;

impl PlaybackSink for NullSink {
    fn play_at(&mut self, _source_id: u64, _buf: &PlayableBuffer, _start: f64) {}
    fn stop_all(&mut self) {}
}

struct ScheduledSource {
    ends_at: f64,
}

/// Schedules decoded model-audio buffers for gapless sequential playback.
pub struct PlaybackScheduler {
    clock: Box<dyn PlaybackClock>,
    sink: Box<dyn PlaybackSink>,
    /// Next start time (seconds). Zero when idle.
    cursor: f64,
    next_source_id: u64,
    /// Currently scheduled or playing sources.
    active: Vec<ScheduledSource>,
}

impl PlaybackScheduler {
    pub fn new(clock: Box<dyn PlaybackClock>, sink: Box<dyn PlaybackSink>) -> Self {
        Self {
            clock,
            sink,
            cursor: 0.0,
            next_source_id: 0,
            active: Vec::new(),
        }
    }

    /// Headless scheduler: wall clock, discarded audio.
    pub fn headless() -> Self {
        Self::new(Box::new(WallClock::new()), Box::new(NullSink))
    }

    /// Schedule `buf` to start at `max(cursor, now)`. Returns the start time.
    pub fn schedule(&mut self, buf: &PlayableBuffer) -> f64 {
        let now = self.clock.now();
        self.active.retain(|s| s.ends_at > now);

        let start = self.cursor.max(now);
        let duration = buf.duration_secs();

        let id = self.next_source_id;
        self.next_source_id += 1;

        self.sink.play_at(id, buf, start);
        self.cursor = start + duration;
        self.active.push(ScheduledSource {
            ends_at: self.cursor,
        });

        debug!(source_id = id, start, duration, "scheduled model audio");
        start
    }

    /// Halt every tracked source and reset the cursor to zero.
    pub fn stop_all(&mut self) {
        if !self.active.is_empty() {
            debug!(sources = self.active.len(), "stopping all playback sources");
        }
        self.sink.stop_all();
        self.active.clear();
        self.cursor = 0.0;
    }

    /// Number of sources scheduled or playing right now.
    pub fn active_sources(&self) -> usize {
        let now = self.clock.now();
        self.active.iter().filter(|s| s.ends_at > now).count()
    }
}

#[cfg(feature = "audio-cpal")]
pub use cpal_sink::CpalSink;

#[cfg(feature = "audio-cpal")]
mod cpal_sink {
    //! cpal-backed sink: a mono output stream whose callback mixes every
    //! scheduled source that has reached its start frame.
    //!
    //! The callback uses `try_lock` on the source list — on contention it
    //! renders silence for that quantum rather than blocking the render
    //! thread.

    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{SampleRate, Stream, StreamConfig};
    use parking_lot::Mutex;
    use tracing::{error, info, warn};

    use super::{PlaybackClock, PlaybackSink};
    use crate::buffering::chunk::PlayableBuffer;
    use crate::error::{ColloquyError, Result};

    struct OutSource {
        start_frame: u64,
        data: Vec<f32>,
        pos: usize,
    }

    struct Shared {
        frames_rendered: AtomicU64,
        sources: Mutex<Vec<OutSource>>,
    }

    /// Owns the cpal output stream. Dropping the sink closes the stream.
    pub struct CpalSink {
        shared: Arc<Shared>,
        sample_rate: u32,
        /// Kept alive for the life of the sink.
        _stream: Stream,
    }

    impl CpalSink {
        /// Open the default output device at `sample_rate` (24 kHz for model
        /// audio), mono.
        pub fn open_default(sample_rate: u32) -> Result<Self> {
            let host = cpal::default_host();
            let device = host.default_output_device().ok_or_else(|| {
                ColloquyError::CaptureUnsupported("no output device".into())
            })?;

            info!(
                device = device.name().unwrap_or_default().as_str(),
                sample_rate, "opening output device"
            );

            let config = StreamConfig {
                channels: 1,
                sample_rate: SampleRate(sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };

            let shared = Arc::new(Shared {
                frames_rendered: AtomicU64::new(0),
                sources: Mutex::new(Vec::new()),
            });
            let cb_shared = Arc::clone(&shared);

            let stream = device
                .build_output_stream(
                    &config,
                    move |out: &mut [f32], _info| {
                        let t0 = cb_shared.frames_rendered.load(Ordering::Relaxed);
                        out.fill(0.0);

                        if let Some(mut sources) = cb_shared.sources.try_lock() {
                            for src in sources.iter_mut() {
                                for (i, slot) in out.iter_mut().enumerate() {
                                    let t = t0 + i as u64;
                                    if t < src.start_frame || src.pos >= src.data.len() {
                                        continue;
                                    }
                                    *slot += src.data[src.pos];
                                    src.pos += 1;
                                }
                            }
                            sources.retain(|s| s.pos < s.data.len());
                        }
                        // On contention: silence for this quantum, sources
                        // resume at the next callback.

                        cb_shared
                            .frames_rendered
                            .fetch_add(out.len() as u64, Ordering::Relaxed);
                    },
                    |err| error!("output stream error: {err}"),
                    None,
                )
                .map_err(|e| ColloquyError::AudioStream(e.to_string()))?;

            stream
                .play()
                .map_err(|e| ColloquyError::AudioStream(e.to_string()))?;

            Ok(Self {
                shared,
                sample_rate,
                _stream: stream,
            })
        }

        /// A clock tied to this sink's rendered-frame counter. Use it as the
        /// scheduler clock so cursor math and mixing share one timebase.
        pub fn clock(&self) -> CpalSinkClock {
            CpalSinkClock {
                shared: Arc::clone(&self.shared),
                sample_rate: self.sample_rate,
            }
        }
    }

    impl PlaybackSink for CpalSink {
        fn play_at(&mut self, source_id: u64, buf: &PlayableBuffer, start: f64) {
            if buf.sample_rate != self.sample_rate {
                warn!(
                    buffer_rate = buf.sample_rate,
                    sink_rate = self.sample_rate,
                    "scheduled buffer rate does not match output stream"
                );
            }
            // Downmix multi-channel buffers to mono.
            let frames = buf.frames();
            let mut data = vec![0f32; frames];
            for ch in &buf.channels {
                for (i, s) in ch.iter().enumerate() {
                    data[i] += s / buf.channels.len() as f32;
                }
            }
            let start_frame = (start * self.sample_rate as f64) as u64;
            tracing::debug!(source_id, start_frame, frames, "queued source on output stream");
            self.shared.sources.lock().push(OutSource {
                start_frame,
                data,
                pos: 0,
            });
        }

        fn stop_all(&mut self) {
            self.shared.sources.lock().clear();
        }
    }

    pub struct CpalSinkClock {
        shared: Arc<Shared>,
        sample_rate: u32,
    }

    impl PlaybackClock for CpalSinkClock {
        fn now(&self) -> f64 {
            self.shared.frames_rendered.load(Ordering::Relaxed) as f64 / self.sample_rate as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Test clock advanced by hand.
    #[derive(Clone)]
    pub struct ManualClock(Arc<Mutex<f64>>);

    impl ManualClock {
        fn new() -> Self {
            Self(Arc::new(Mutex::new(0.0)))
        }

        fn advance(&self, secs: f64) {
            *self.0.lock() += secs;
        }
    }

    impl PlaybackClock for ManualClock {
        fn now(&self) -> f64 {
            *self.0.lock()
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        starts: Arc<Mutex<Vec<(u64, f64)>>>,
        stops: Arc<Mutex<usize>>,
    }

    impl PlaybackSink for RecordingSink {
        fn play_at(&mut self, source_id: u64, _buf: &PlayableBuffer, start: f64) {
            self.starts.lock().push((source_id, start));
        }

        fn stop_all(&mut self) {
            *self.stops.lock() += 1;
        }
    }

    fn buffer_of(secs: f64) -> PlayableBuffer {
        let frames = (secs * 24_000.0).round() as usize;
        PlayableBuffer {
            channels: vec![vec![0.0; frames]],
            sample_rate: 24_000,
        }
    }

    #[test]
    fn burst_arrivals_schedule_back_to_back() {
        let clock = ManualClock::new();
        let sink = RecordingSink::default();
        let starts = Arc::clone(&sink.starts);
        let mut sched = PlaybackScheduler::new(Box::new(clock), Box::new(sink));

        let s1 = sched.schedule(&buffer_of(0.5));
        let s2 = sched.schedule(&buffer_of(0.25));
        let s3 = sched.schedule(&buffer_of(1.0));

        assert_eq!(s1, 0.0);
        assert!((s2 - 0.5).abs() < 1e-9);
        assert!((s3 - 0.75).abs() < 1e-9);
        assert_eq!(starts.lock().len(), 3);
    }

    #[test]
    fn cursor_self_corrects_when_playback_falls_behind() {
        let clock = ManualClock::new();
        let handle = clock.clone();
        let mut sched =
            PlaybackScheduler::new(Box::new(clock), Box::new(RecordingSink::default()));

        let s1 = sched.schedule(&buffer_of(0.2));
        assert_eq!(s1, 0.0);

        // A long gap: the next chunk arrives well after the first finished.
        handle.advance(5.0);
        let s2 = sched.schedule(&buffer_of(0.2));
        assert!((s2 - 5.0).abs() < 1e-9, "start should snap to now, got {s2}");
    }

    #[test]
    fn stop_all_resets_cursor_and_sources() {
        let clock = ManualClock::new();
        let sink = RecordingSink::default();
        let stops = Arc::clone(&sink.stops);
        let mut sched = PlaybackScheduler::new(Box::new(clock), Box::new(sink));

        sched.schedule(&buffer_of(1.0));
        sched.schedule(&buffer_of(1.0));
        assert_eq!(sched.active_sources(), 2);

        sched.stop_all();
        assert_eq!(*stops.lock(), 1);
        assert_eq!(sched.active_sources(), 0);

        // Cursor is back at zero: next chunk starts immediately.
        let s = sched.schedule(&buffer_of(0.5));
        assert_eq!(s, 0.0);
    }

    #[test]
    fn finished_sources_are_reaped() {
        let clock = ManualClock::new();
        let handle = clock.clone();
        let mut sched =
            PlaybackScheduler::new(Box::new(clock), Box::new(RecordingSink::default()));

        sched.schedule(&buffer_of(0.5));
        handle.advance(1.0);
        assert_eq!(sched.active_sources(), 0);
        sched.schedule(&buffer_of(0.5));
        assert_eq!(sched.active_sources(), 1);
    }
}
