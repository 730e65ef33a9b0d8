//! # colloquy-core
//!
//! Engine for live, bidirectional voice/video conversations with a
//! streaming model service. Embeddable: the host brings a video source and
//! an API endpoint; the engine owns capture, encoding, playback, turn
//! assembly, and session lifecycle.
//!
//! ```text
//!  microphone ──► cpal callback ──► SPSC ring ──► uplink pump
//!                                                (resample → i16 quanta)
//!                                                      │
//!  video source ──► JPEG frames (~1 Hz) ──────────┐    ▼
//!                                                 ├─► SessionTransport ◄──┐
//!                                                 │      (WebSocket)      │
//!            ┌────────────────────────────────────┴───────────┐           │
//!            ▼                                                │           │
//!      InboundEvent stream                                    │           │
//!            │                                                │           │
//!    ┌───────┴────────┬──────────────────┐                    │           │
//!    ▼                ▼                  ▼                    │           │
//! PlaybackScheduler  TurnSynchronizer  SessionState       setup msg    remote
//! (gapless audio)    (line-split turns) (broadcast)                   service
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! # #[cfg(feature = "ws")]
//! # async fn demo() -> colloquy_core::Result<()> {
//! use colloquy_core::{
//!     CaptureBackend, LiveSession, PlaybackScheduler, SessionConfig, StartOptions, WsTransport,
//! };
//!
//! let session = LiveSession::new(
//!     SessionConfig::default(),
//!     WsTransport::new("wss://example.invalid/v1/live"),
//!     PlaybackScheduler::headless(),
//! );
//!
//! let mut turns = session.subscribe_turns();
//! session
//!     .start(StartOptions {
//!         video: my_camera(),
//!         system_instruction: Some("You are a helpful interpreter.".into()),
//!         capture: CaptureBackend::Microphone,
//!     })
//!     .await?;
//!
//! while let Ok(turn) = turns.recv().await {
//!     println!("{}: {} audio lines", turn.output_text, turn.model_lines.len());
//! }
//! session.stop();
//! # Ok(())
//! # }
//! # fn my_camera() -> Option<Box<dyn colloquy_core::VideoSource>> { None }
//! ```
//!
//! ## Features
//!
//! - `audio-cpal` (default): microphone capture and speaker playback via
//!   cpal. Without it, capture returns `CaptureUnsupported` and playback
//!   needs a custom [`PlaybackSink`].
//! - `ws`: the tokio-tungstenite [`WsTransport`]. Without it, bring your
//!   own [`SessionTransport`].

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod error;
pub mod events;
pub mod reengage;
pub mod session;
pub mod transport;

pub use audio::codec::CAPTURE_MIME_TYPE;
pub use audio::playback::{NullSink, PlaybackClock, PlaybackScheduler, PlaybackSink};
pub use audio::CaptureBackend;
pub use buffering::chunk::{AudioChunk, PlayableBuffer};
pub use error::{ColloquyError, Result};
pub use events::{SessionErrorEvent, SessionState, SessionStateEvent, TurnEvent};
pub use reengage::{
    ActivityTokens, ReengageConfig, ReengageContext, ReengagePhase, ReengagementScheduler,
};
pub use session::turn::{TurnOutput, TurnSynchronizer};
pub use session::{LiveSession, SessionConfig, StartOptions, VideoSource};
pub use transport::{
    InboundEvent, ResponseModality, SessionTransport, TransportConfig, CAPTURE_SAMPLE_RATE,
    MODEL_AUDIO_SAMPLE_RATE,
};

#[cfg(feature = "ws")]
pub use transport::ws::WsTransport;
