//! Wire codec for the streaming protocol.
//!
//! Outbound messages are JSON envelopes around base64 media blobs; inbound
//! server messages are decoded into [`InboundEvent`]s exactly once, here.
//!
//! Decoding one server message yields its audio chunks **before** any
//! transcript delta it carries. The turn synchronizer relies on that order:
//! a split point recorded for a delta must see the sample total including
//! audio that arrived in the same message.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use super::{InboundEvent, ResponseModality, TransportConfig};
use crate::error::{ColloquyError, Result};

/// One capture quantum: base64 of raw 16-bit LE PCM.
/// `mimeType` is always `audio/pcm;rate=16000`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundAudioFrame {
    pub data: String,
    pub mime_type: String,
}

/// One video frame: base64 JPEG, `mimeType` `image/jpeg`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundVideoFrame {
    pub data: String,
    pub mime_type: String,
}

impl OutboundVideoFrame {
    pub fn from_jpeg(bytes: &[u8]) -> Self {
        Self {
            data: B64.encode(bytes),
            mime_type: "image/jpeg".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound envelopes
// ---------------------------------------------------------------------------

/// The session-open message, sent once after the socket opens.
pub fn setup_message(config: &TransportConfig) -> String {
    let modality = match config.response_modality {
        ResponseModality::Audio => "AUDIO",
        ResponseModality::Text => "TEXT",
    };

    let mut setup = json!({
        "generationConfig": { "responseModalities": [modality] },
    });

    if let Some(ref instruction) = config.system_instruction {
        setup["systemInstruction"] = json!({ "parts": [{ "text": instruction }] });
    }
    if config.transcription_enabled {
        setup["inputAudioTranscription"] = json!({});
        setup["outputAudioTranscription"] = json!({});
    }

    json!({ "setup": setup }).to_string()
}

/// Envelope for one outbound media blob (audio or video frame).
pub fn realtime_input_message<T: Serialize>(frame: &T) -> String {
    json!({ "realtimeInput": { "mediaChunks": [frame] } }).to_string()
}

// ---------------------------------------------------------------------------
// Inbound decoding
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    input_transcription: Option<TranscriptionDelta>,
    output_transcription: Option<TranscriptionDelta>,
    #[serde(default)]
    turn_complete: bool,
    #[serde(default)]
    interrupted: bool,
}

#[derive(Debug, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineBlob>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineBlob {
    #[allow(dead_code)]
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct TranscriptionDelta {
    #[serde(default)]
    text: String,
}

/// Decode one raw server message into ordered inbound events.
///
/// A malformed base64 blob inside an otherwise valid message is logged and
/// skipped (per-chunk isolation); a structurally invalid message is a
/// `Decode` error the caller should log and drop.
pub fn decode_server_message(raw: &str) -> Result<Vec<InboundEvent>> {
    let msg: ServerMessage = serde_json::from_str(raw)
        .map_err(|e| ColloquyError::Decode(format!("server message: {e}")))?;

    let mut events = Vec::new();

    if msg.setup_complete.is_some() {
        events.push(InboundEvent::Opened);
    }

    if let Some(content) = msg.server_content {
        // Audio first: split points recorded for this message's deltas must
        // already include this message's audio.
        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                let Some(blob) = part.inline_data else { continue };
                match B64.decode(&blob.data) {
                    Ok(bytes) => events.push(InboundEvent::AudioChunk(bytes)),
                    Err(e) => warn!("dropping malformed audio blob: {e}"),
                }
            }
        }

        if let Some(delta) = content.input_transcription {
            if !delta.text.is_empty() {
                events.push(InboundEvent::InputDelta(delta.text));
            }
        }
        if let Some(delta) = content.output_transcription {
            if !delta.text.is_empty() {
                events.push(InboundEvent::OutputDelta(delta.text));
            }
        }

        if content.interrupted {
            events.push(InboundEvent::Interrupted);
        }
        if content.turn_complete {
            events.push(InboundEvent::TurnComplete);
        }
    }

    Ok(events)
}
