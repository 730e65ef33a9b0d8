//! Event types broadcast to the embedding application.
//!
//! The session exposes three `tokio::sync::broadcast` channels, one per
//! event family:
//!
//! | Event | Channel accessor |
//! |-------|------------------|
//! | [`SessionStateEvent`] | `LiveSession::subscribe_state` |
//! | [`TurnEvent`] | `LiveSession::subscribe_turns` |
//! | [`SessionErrorEvent`] | `LiveSession::subscribe_errors` |
//!
//! All types derive serde so hosts can forward them over an IPC bridge
//! unchanged.

use serde::{Deserialize, Serialize};

use crate::buffering::chunk::AudioChunk;

/// Lifecycle state of a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No session. The engine may be started.
    Idle,
    /// `start()` accepted; transport open in flight.
    Connecting,
    /// Remote acknowledged open; media is flowing.
    Active,
    /// Torn down after a transport failure. Restart is the caller's call.
    Error,
}

/// Emitted on every state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStateEvent {
    pub state: SessionState,
    /// Optional human-readable detail (e.g. the error that forced teardown).
    pub detail: Option<String>,
}

/// Emitted when a transport error forces the session into `Error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionErrorEvent {
    pub message: String,
}

/// One completed conversational exchange, emitted on `turnComplete`.
///
/// `model_lines` holds the turn's model audio split at transcript newline
/// boundaries, in order; their concatenation equals the turn's full model
/// audio. `user_audio` is the silence-trimmed capture for the turn, absent
/// when the microphone was disabled or the trim removed everything.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnEvent {
    /// Monotonically increasing turn sequence number within the session.
    pub seq: u64,
    pub input_text: String,
    pub output_text: String,
    pub user_audio: Option<AudioChunk>,
    pub model_lines: Vec<AudioChunk>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_state_serializes_lowercase() {
        let event = SessionStateEvent {
            state: SessionState::Connecting,
            detail: None,
        };
        let json = serde_json::to_value(&event).expect("serialize state event");
        assert_eq!(json["state"], "connecting");
        assert_eq!(json["detail"], serde_json::Value::Null);
    }

    #[test]
    fn turn_event_round_trips_with_camel_case_fields() {
        let event = TurnEvent {
            seq: 4,
            input_text: "hola".into(),
            output_text: "hello\n".into(),
            user_audio: None,
            model_lines: vec![AudioChunk::new(vec![1, 2, 3], 24_000)],
        };

        let json = serde_json::to_value(&event).expect("serialize turn event");
        assert_eq!(json["seq"], 4);
        assert_eq!(json["inputText"], "hola");
        assert_eq!(json["modelLines"][0]["sampleRate"], 24_000);

        let back: TurnEvent = serde_json::from_value(json).expect("deserialize turn event");
        assert_eq!(back.model_lines[0].samples, vec![1, 2, 3]);
    }
}
