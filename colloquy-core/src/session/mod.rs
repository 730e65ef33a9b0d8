//! `LiveSession` — lifecycle controller for one live conversation.
//!
//! ## Lifecycle
//!
//! ```text
//! LiveSession::new()
//!     └─► start()      → capture open, transport connected, state = Connecting
//!         └─► Opened   → state = Active, media flowing both ways
//!             └─► stop() / Closed → teardown, state = Idle
//!             └─► Error           → teardown, state = Error
//! ```
//!
//! Exactly one session is active per `LiveSession`; calling `start()` again
//! tears the previous session down first. Every teardown path runs the same
//! cleanup: capture stopped, playback halted, transport closed, turn
//! accumulators cleared, epoch invalidated.
//!
//! ## The epoch
//!
//! `stop()` (or a restart) can race ahead of any in-flight async
//! continuation — the transport's `connect` may still be resolving, late
//! inbound events may sit in the channel. Every continuation therefore
//! re-checks the session epoch before mutating shared state; a stale epoch
//! means the work belongs to a dead session and is discarded.
//!
//! ## Threading
//!
//! `cpal::Stream` is `!Send`, so capture is opened *inside* `spawn_blocking`
//! and never crosses threads; the uplink pump runs on that same thread and
//! hands i16 frames to the async side over a bounded channel whose
//! `try_send` drops frames under backpressure instead of blocking.

pub mod turn;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::{
    audio::{codec, playback::PlaybackScheduler, AudioCapture, CaptureBackend},
    buffering::{create_capture_ring, CaptureConsumer, Consumer},
    error::{ColloquyError, Result},
    events::{SessionErrorEvent, SessionState, SessionStateEvent, TurnEvent},
    transport::{
        InboundEvent, OutboundVideoFrame, ResponseModality, SessionTransport, TransportConfig,
        MODEL_AUDIO_SAMPLE_RATE,
    },
};

use self::turn::TurnSynchronizer;

/// Broadcast capacity for each event family.
const BROADCAST_CAP: usize = 256;

/// Uplink frame channel depth. ~32 quanta of headroom before frames drop.
const UPLINK_CHANNEL_CAP: usize = 32;

/// Samples drained from the capture ring per pump iteration.
const DRAIN_CHUNK: usize = 960;

/// Pump sleep when the capture ring is empty.
const PUMP_SLEEP_EMPTY_MS: u64 = 5;

/// Configuration for a `LiveSession`.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// What the model answers with. Default: audio.
    pub response_modality: ResponseModality,
    /// Ask the service for input + output transcription. Default: true.
    /// The turn synchronizer needs output transcription to split lines.
    pub transcription_enabled: bool,
    /// Cadence of outbound video frames. Default: 1 s (≈1 Hz).
    pub video_frame_interval: Duration,
    /// Capture quantum in samples at 16 kHz per outbound frame.
    /// Default: 512 (32 ms).
    pub capture_quantum: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            response_modality: ResponseModality::Audio,
            transcription_enabled: true,
            video_frame_interval: Duration::from_secs(1),
            capture_quantum: 512,
        }
    }
}

/// Source of outbound video frames. The 15-minute continuous-recording cap
/// is the source's concern, not the session's.
pub trait VideoSource: Send + 'static {
    /// Whether the underlying stream is live.
    fn is_active(&self) -> bool;

    /// Capture one JPEG frame (quality ≈ 0.5 by convention).
    fn next_jpeg(&mut self) -> Result<Vec<u8>>;
}

/// Per-`start()` parameters.
pub struct StartOptions {
    /// Required: the session rejects with `NoActiveStream` when this is
    /// absent or inactive.
    pub video: Option<Box<dyn VideoSource>>,
    pub system_instruction: Option<String>,
    pub capture: CaptureBackend,
}

struct Shared<T: SessionTransport> {
    config: SessionConfig,
    transport: T,
    state: Mutex<SessionState>,
    /// `true` while a session is live (connecting or active).
    running: AtomicBool,
    /// Bumped on every start and teardown; stale continuations no-op.
    epoch: AtomicU64,
    synchronizer: Mutex<TurnSynchronizer>,
    playback: Mutex<PlaybackScheduler>,
    state_tx: broadcast::Sender<SessionStateEvent>,
    turn_tx: broadcast::Sender<TurnEvent>,
    error_tx: broadcast::Sender<SessionErrorEvent>,
    turn_seq: AtomicU64,
}

impl<T: SessionTransport> Shared<T> {
    fn epoch_is(&self, expected: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == expected
    }

    fn set_state(&self, state: SessionState, detail: Option<String>) {
        *self.state.lock() = state;
        let _ = self.state_tx.send(SessionStateEvent { state, detail });
    }

    /// The one cleanup path. Safe to call repeatedly.
    fn teardown(&self, next: SessionState, detail: Option<String>) {
        self.running.store(false, Ordering::SeqCst);
        // Invalidate every in-flight continuation before touching state.
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.playback.lock().stop_all();
        self.transport.close();
        self.synchronizer.lock().reset();
        self.set_state(next, detail);
        info!(state = ?next, "session torn down");
    }
}

/// The top-level session handle.
///
/// `Send + Sync` — all fields use interior mutability. Wrap in `Arc` to
/// share between the host application and event-forwarding tasks.
pub struct LiveSession<T: SessionTransport> {
    shared: Arc<Shared<T>>,
}

impl<T: SessionTransport> LiveSession<T> {
    /// Create a session handle. Does not connect — call `start()`.
    ///
    /// The playback scheduler is injected so hosts choose the sink
    /// (`CpalSink` for speakers, `NullSink` headless).
    pub fn new(config: SessionConfig, transport: T, playback: PlaybackScheduler) -> Self {
        let (state_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (turn_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (error_tx, _) = broadcast::channel(BROADCAST_CAP);

        Self {
            shared: Arc::new(Shared {
                config,
                transport,
                state: Mutex::new(SessionState::Idle),
                running: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                synchronizer: Mutex::new(TurnSynchronizer::new()),
                playback: Mutex::new(playback),
                state_tx,
                turn_tx,
                error_tx,
                turn_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Start a live session. Tears down any previous session first.
    ///
    /// Resolves after the transport connection is acknowledged; the state
    /// moves `connecting → active` when the `Opened` event arrives.
    ///
    /// # Errors
    /// - `NoActiveStream` when `options.video` is absent or inactive.
    /// - `CaptureUnsupported` / `PermissionDenied` from the microphone path.
    /// - `Connection` when the transport fails to open.
    ///
    /// Every failure leaves the session fully cleaned up in `Error` state.
    pub async fn start(&self, options: StartOptions) -> Result<()> {
        if self.shared.running.load(Ordering::SeqCst) {
            debug!("start() while running — tearing down previous session");
            self.stop();
        }

        let video = match options.video {
            Some(v) if v.is_active() => v,
            _ => return Err(ColloquyError::NoActiveStream),
        };

        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.set_state(SessionState::Connecting, None);

        if options.capture == CaptureBackend::Microphone {
            if let Err(e) = self.spawn_capture(epoch).await {
                self.shared.teardown(SessionState::Error, Some(e.to_string()));
                return Err(e);
            }
        }

        let transport_config = TransportConfig {
            system_instruction: options.system_instruction,
            response_modality: self.shared.config.response_modality,
            transcription_enabled: self.shared.config.transcription_enabled,
        };

        let events = match self.shared.transport.connect(transport_config).await {
            Ok(rx) => rx,
            Err(e) => {
                self.shared.teardown(SessionState::Error, Some(e.to_string()));
                return Err(e);
            }
        };

        if !self.shared.epoch_is(epoch) {
            // stop() raced ahead of connect; teardown already ran.
            debug!("connect resolved for a stopped session — discarding");
            self.shared.transport.close();
            return Ok(());
        }

        tokio::spawn(event_loop(Arc::clone(&self.shared), epoch, events));
        tokio::spawn(video_loop(Arc::clone(&self.shared), epoch, video));

        info!("session started — awaiting open acknowledgement");
        Ok(())
    }

    /// Stop the session. Idempotent; safe from any state, including while
    /// `start()` is still resolving.
    pub fn stop(&self) {
        if !self.shared.running.load(Ordering::SeqCst) {
            // Still invalidate: a start() may be mid-flight.
            self.shared.epoch.fetch_add(1, Ordering::SeqCst);
            return;
        }
        self.shared.teardown(SessionState::Idle, None);
    }

    /// Current state (snapshot).
    pub fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<SessionStateEvent> {
        self.shared.state_tx.subscribe()
    }

    pub fn subscribe_turns(&self) -> broadcast::Receiver<TurnEvent> {
        self.shared.turn_tx.subscribe()
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<SessionErrorEvent> {
        self.shared.error_tx.subscribe()
    }

    /// Open the microphone and wire the uplink: callback → ring → pump
    /// (resample + i16) → frame channel → transport + synchronizer.
    async fn spawn_capture(&self, epoch: u64) -> Result<()> {
        let (producer, consumer) = create_capture_ring();
        let (open_tx, open_rx) = tokio::sync::oneshot::channel::<Result<u32>>();
        let (frame_tx, frame_rx) = mpsc::channel::<Vec<i16>>(UPLINK_CHANNEL_CAP);

        let shared = Arc::clone(&self.shared);
        let quantum = self.shared.config.capture_quantum;

        tokio::task::spawn_blocking(move || {
            // Device open must happen on THIS thread — cpal::Stream is !Send.
            let capture_running = Arc::new(AtomicBool::new(true));
            let capture =
                match AudioCapture::open_default(producer, Arc::clone(&capture_running)) {
                    Ok(c) => {
                        let _ = open_tx.send(Ok(c.sample_rate));
                        c
                    }
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };

            run_uplink_pump(&shared, epoch, consumer, capture.sample_rate, quantum, frame_tx);

            // Stream drops here, releasing the device on this thread.
            capture.stop();
        });

        let rate = open_rx
            .await
            .map_err(|_| ColloquyError::AudioStream("capture thread died during open".into()))??;
        info!(capture_rate = rate, "microphone open");

        // Forwarder: frames → outbound transport + the turn's user side.
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let mut frame_rx = frame_rx;
            while let Some(frame) = frame_rx.recv().await {
                if !shared.epoch_is(epoch) {
                    break;
                }
                shared.transport.send_audio(codec::encode_audio_frame(&frame));
                shared.synchronizer.lock().on_user_audio(&frame);
            }
        });

        Ok(())
    }
}

impl<T: SessionTransport> Drop for LiveSession<T> {
    /// Safety net only — hosts should call `stop()` explicitly. Hardware
    /// release must not wait for the allocator.
    fn drop(&mut self) {
        if self.shared.running.load(Ordering::SeqCst) {
            warn!("LiveSession dropped while running — forcing teardown");
            self.shared.teardown(SessionState::Idle, None);
        }
    }
}

/// Blocking uplink pump: ring → resample to 16 kHz → i16 quanta → channel.
/// Runs until the epoch goes stale. `try_send` drops quanta when the async
/// side falls behind — capture never blocks.
fn run_uplink_pump<T: SessionTransport>(
    shared: &Shared<T>,
    epoch: u64,
    mut consumer: CaptureConsumer,
    capture_rate: u32,
    quantum: usize,
    frame_tx: mpsc::Sender<Vec<i16>>,
) {
    use crate::transport::CAPTURE_SAMPLE_RATE;

    let mut converter =
        match crate::audio::resample::RateConverter::new(capture_rate, CAPTURE_SAMPLE_RATE, DRAIN_CHUNK)
        {
            Ok(c) => c,
            Err(e) => {
                warn!("uplink pump aborted: {e}");
                return;
            }
        };

    let mut raw = vec![0f32; DRAIN_CHUNK];
    let mut converted: Vec<f32> = Vec::new();
    let mut pending: Vec<i16> = Vec::with_capacity(quantum);
    let mut dropped_frames = 0usize;

    let mut emit = |converted: &[f32], pending: &mut Vec<i16>, dropped: &mut usize| {
        for &sample in converted {
            pending.push(codec::f32_to_i16(sample));
            if pending.len() == quantum {
                let frame = std::mem::replace(pending, Vec::with_capacity(quantum));
                if frame_tx.try_send(frame).is_err() {
                    *dropped += 1;
                    if *dropped % 50 == 1 {
                        warn!(dropped = *dropped, "uplink backpressure: dropping capture frames");
                    }
                }
            }
        }
    };

    loop {
        if !shared.epoch_is(epoch) || !shared.running.load(Ordering::SeqCst) {
            break;
        }

        let n = consumer.pop_slice(&mut raw);
        if n == 0 {
            std::thread::sleep(Duration::from_millis(PUMP_SLEEP_EMPTY_MS));
            continue;
        }

        converted.clear();
        converter.process_into(&raw[..n], &mut converted);
        emit(&converted, &mut pending, &mut dropped_frames);
    }

    // Drain the converter's carried tail; a final partial quantum is dropped.
    converted.clear();
    converter.flush(&mut converted);
    emit(&converted, &mut pending, &mut dropped_frames);

    debug!(dropped_frames, "uplink pump stopped");
}

/// Inbound event loop for one connection epoch.
async fn event_loop<T: SessionTransport>(
    shared: Arc<Shared<T>>,
    epoch: u64,
    mut events: mpsc::Receiver<InboundEvent>,
) {
    while let Some(event) = events.recv().await {
        if !shared.epoch_is(epoch) {
            debug!("discarding inbound event for stale epoch");
            break;
        }

        match event {
            InboundEvent::Opened => {
                info!("transport acknowledged open");
                shared.set_state(SessionState::Active, None);
            }

            InboundEvent::AudioChunk(bytes) => {
                let pcm = match codec::bytes_to_pcm(&bytes) {
                    Ok(pcm) => pcm,
                    Err(e) => {
                        // Isolated per chunk; the turn and session continue.
                        warn!("dropping malformed model audio: {e}");
                        continue;
                    }
                };
                let playable = crate::buffering::chunk::PlayableBuffer {
                    channels: vec![pcm.iter().map(|s| *s as f32 / 32_768.0).collect()],
                    sample_rate: MODEL_AUDIO_SAMPLE_RATE,
                };
                shared.synchronizer.lock().on_model_audio(pcm);
                shared.playback.lock().schedule(&playable);
            }

            InboundEvent::InputDelta(text) => {
                shared.synchronizer.lock().on_input_delta(&text);
            }

            InboundEvent::OutputDelta(text) => {
                shared.synchronizer.lock().on_output_delta(&text);
            }

            InboundEvent::TurnComplete => {
                let output = shared.synchronizer.lock().complete();
                let seq = shared.turn_seq.fetch_add(1, Ordering::Relaxed);
                debug!(
                    seq,
                    lines = output.model_lines.len(),
                    "turn complete"
                );
                let _ = shared.turn_tx.send(TurnEvent {
                    seq,
                    input_text: output.input_text,
                    output_text: output.output_text,
                    user_audio: output.user_audio,
                    model_lines: output.model_lines,
                });
            }

            InboundEvent::Interrupted => {
                // Halt audibly first, then drop the model side of the turn.
                shared.playback.lock().stop_all();
                shared.synchronizer.lock().on_interrupted();
            }

            InboundEvent::Closed => {
                shared.teardown(SessionState::Idle, None);
                break;
            }

            InboundEvent::Error(message) => {
                shared.teardown(SessionState::Error, Some(message.clone()));
                let _ = shared.error_tx.send(SessionErrorEvent { message });
                break;
            }
        }
    }
}

/// Outbound video frames at the configured cadence (≈1 Hz).
async fn video_loop<T: SessionTransport>(
    shared: Arc<Shared<T>>,
    epoch: u64,
    mut video: Box<dyn VideoSource>,
) {
    let mut ticker = tokio::time::interval(shared.config.video_frame_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if !shared.epoch_is(epoch) || !shared.running.load(Ordering::SeqCst) {
            break;
        }
        if !video.is_active() {
            debug!("video source inactive — skipping frame");
            continue;
        }
        match video.next_jpeg() {
            Ok(bytes) => shared
                .transport
                .send_video(OutboundVideoFrame::from_jpeg(&bytes)),
            Err(e) => debug!("skipping video frame: {e}"),
        }
    }
    debug!("video loop stopped");
}
