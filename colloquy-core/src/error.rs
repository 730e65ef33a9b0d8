use thiserror::Error;

/// All errors produced by colloquy-core.
#[derive(Debug, Error)]
pub enum ColloquyError {
    /// `start()` was called without a usable media source attached.
    #[error("no active media stream")]
    NoActiveStream,

    /// The host denied microphone or camera access.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The platform cannot provide the dedicated audio-capture path
    /// (no input device, unsupported sample format, feature compiled out).
    #[error("audio capture unsupported: {0}")]
    CaptureUnsupported(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    /// Transport failed to open, or reported a fatal error mid-session.
    #[error("connection error: {0}")]
    Connection(String),

    /// Malformed inbound audio or wire message. Isolated per chunk —
    /// never aborts the turn or the session.
    #[error("decode error: {0}")]
    Decode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ColloquyError>;
