//! Transport boundary to the remote conversational service.
//!
//! The `SessionTransport` trait decouples the session from any specific
//! backend (the WebSocket client under the `ws` feature, scripted fakes in
//! tests). Inbound traffic is decoded **once** at this boundary into the
//! closed [`InboundEvent`] union; nothing past the transport ever touches
//! raw wire payloads.
//!
//! Inbound events for one connection are delivered in arrival order.
//! Consumers must check the session epoch before mutating shared state —
//! a late event from a closed connection carries a stale epoch and is
//! discarded by the session's event loop.

pub mod wire;

#[cfg(feature = "ws")]
pub mod ws;

use std::future::Future;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

pub use wire::{OutboundAudioFrame, OutboundVideoFrame};

/// Model audio arrives as 16-bit PCM at this rate, mono.
pub const MODEL_AUDIO_SAMPLE_RATE: u32 = 24_000;

/// Capture audio leaves at this rate.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// What the remote model should answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseModality {
    Audio,
    Text,
}

/// Connection parameters handed to `connect()`.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub system_instruction: Option<String>,
    pub response_modality: ResponseModality,
    /// Ask the service to transcribe both audio directions.
    pub transcription_enabled: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            system_instruction: None,
            response_modality: ResponseModality::Audio,
            transcription_enabled: true,
        }
    }
}

/// Everything the remote end can tell us, decoded at the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// Remote acknowledged the session open.
    Opened,
    /// One chunk of raw 16-bit LE PCM model audio (24 kHz mono).
    AudioChunk(Vec<u8>),
    /// Incremental user-side transcription text.
    InputDelta(String),
    /// Incremental model-side transcription text.
    OutputDelta(String),
    /// The model finished its turn.
    TurnComplete,
    /// The model's in-progress utterance was cut short.
    Interrupted,
    /// Clean remote close.
    Closed,
    /// Fatal transport error with human-readable detail.
    Error(String),
}

/// Contract for streaming-connection backends.
///
/// `send_audio`/`send_video` are fire-and-forget: real-time media tolerates
/// loss, so failures are swallowed (and logged) rather than surfaced.
/// `close()` is idempotent and safe on a never-opened handle.
pub trait SessionTransport: Send + Sync + 'static {
    /// Open the connection. Resolves once the remote end acknowledges, with
    /// the channel on which inbound events will arrive in order.
    fn connect(
        &self,
        config: TransportConfig,
    ) -> impl Future<Output = Result<mpsc::Receiver<InboundEvent>>> + Send;

    /// Best-effort: one capture quantum uplink.
    fn send_audio(&self, frame: OutboundAudioFrame);

    /// Best-effort: one JPEG video frame uplink.
    fn send_video(&self, frame: OutboundVideoFrame);

    /// Close the connection. Idempotent.
    fn close(&self);
}
