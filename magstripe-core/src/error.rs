//! Error types for magstripe-core

/// Result type alias for magstripe-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core protocol errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Frame is too short to be valid
    #[error("Frame too short: expected at least {expected} bytes, got {actual} bytes")]
    FrameTooShort {
        expected: usize,
        actual: usize,
    },

    /// Frame does not start with STX
    #[error("Invalid start byte: 0x{0:02X}")]
    InvalidStart(u8),

    /// Declared length disagrees with the bytes present
    #[error("Length mismatch: header declares {declared} bytes, frame carries {actual} bytes")]
    LengthMismatch {
        declared: usize,
        actual: usize,
    },

    /// CRC verification failed
    #[error("CRC mismatch: expected 0x{expected:04X}, received 0x{received:04X}")]
    CrcMismatch {
        expected: u16,
        received: u16,
    },

    /// Unknown frame format tag
    #[error("Unknown frame tag: 0x{0:02X}")]
    UnknownTag(u8),

    /// Unknown command/parameter code pair
    #[error("Unknown command code: 0x{0:02X} 0x{1:02X}")]
    UnknownCommand(u8, u8),

    /// Status or error digits are not ASCII '0'..'9'
    #[error("Invalid status digits: 0x{0:02X} 0x{1:02X}")]
    InvalidStatus(u8, u8),

    /// Payload too large
    #[error("Payload too large: {size} bytes (max: {max} bytes)")]
    PayloadTooLarge {
        size: usize,
        max: usize,
    },

    /// Payload length not accepted by the operation
    #[error("Invalid payload for {operation}: {actual} bytes (expected {expected})")]
    InvalidPayload {
        operation: crate::operation::Operation,
        expected: &'static str,
        actual: usize,
    },

    /// Invalid reader state transition
    #[error("Invalid reader state: {0}")]
    InvalidState(String),

    /// Key failed parity or weak-key checks
    #[error("Invalid DES key: {0}")]
    InvalidKey(&'static str),

    /// No valid key could be generated
    #[error("Key generation failed after {attempts} attempts")]
    KeyGeneration {
        attempts: usize,
    },

    /// Cipher input is not a whole number of DES blocks
    #[error("Cipher input not block aligned: {len} bytes")]
    NotBlockAligned {
        len: usize,
    },

    /// Key material could not be parsed
    #[error("Invalid key encoding: {0}")]
    KeyEncoding(#[from] hex::FromHexError),
}

impl Error {
    /// Check if the frame could be received again with success
    pub fn is_frame_error(&self) -> bool {
        matches!(
            self,
            Self::FrameTooShort { .. }
                | Self::InvalidStart(_)
                | Self::LengthMismatch { .. }
                | Self::CrcMismatch { .. }
        )
    }
}
