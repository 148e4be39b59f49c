//! Error type shared by the codec, reassembler, and command center.

use thiserror::Error;

/// Errors produced while framing, decoding, or dispatching protocol traffic.
#[derive(Debug, Error)]
pub enum Error {
    /// Unexpectedly reached the end of a buffer while reading or writing a field.
    #[error("end of buffer")]
    Eof,

    /// A field held a value outside of what the wire format allows.
    #[error("invalid value for field")]
    InvalidValue,

    /// A length value encoded in a frame was inconsistent with the data actually present.
    #[error("invalid length value specified")]
    InvalidLength,

    /// Start/end sentinels were missing or a frame's declared length never matched the buffer.
    #[error("garbled frame, buffer discarded")]
    GarbledFrame,

    /// The CRC computed over a decoded frame did not match the trailer.
    #[error("CRC mismatch: expected {expected:#06x}, computed {computed:#06x}")]
    CrcMismatch { expected: u16, computed: u16 },

    /// A frame carried an opcode the dispatcher has no handler for.
    #[error("unsupported opcode {opcode:#04x} for type {frame_type:#04x}")]
    UnsupportedOpcode { frame_type: u8, opcode: u8 },

    /// A history-range opcode arrived while the pump was not in history-upload mode.
    #[error("history opcode {opcode:#04x} requested outside of history-upload mode")]
    ModeViolation { opcode: u8 },

    /// Failed to persist or load `state.json`.
    #[error("state store I/O error")]
    Store(#[from] std::io::Error),

    /// `state.json` could not be parsed as the expected shape.
    #[error("state store serialization error")]
    Serde(#[from] serde_json::Error),

    /// The transport (BLE peripheral stand-in) failed to deliver a write.
    #[error("transport write failed: {0}")]
    Transport(String),
}

pub type Result<T> = core::result::Result<T, Error>;
