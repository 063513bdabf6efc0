//! Error types for the wire protocol

use thiserror::Error;

/// Result type alias using the protocol error
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Protocol encoding and framing errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// I/O errors while reading or writing frames
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame shorter than its header or declared length
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// Checksum did not match the frame contents
    #[error("CRC mismatch: expected {expected:x}, got {actual:x}")]
    CrcMismatch {
        /// Checksum stored in the frame
        expected: u32,
        /// Checksum computed over the received bytes
        actual: u32,
    },

    /// Unknown message type byte
    #[error("Unknown message type: {0}")]
    UnknownType(u8),

    /// bincode (de)serialization failures
    #[error("Codec error: {0}")]
    Codec(String),

    /// Frame larger than the configured maximum
    #[error("Frame too large: {0} bytes")]
    TooLarge(usize),
}

impl ProtocolError {
    /// Create a malformed frame error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    /// Create a codec error
    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }
}
