//! Transport errors

use std::io;

use magstripe_core::constants::status;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Not connected")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Unsupported baud rate: {0}")]
    InvalidBaudRate(u32),

    #[error("Failed to open port {port}: {reason}")]
    PortOpenFailed { port: String, reason: String },

    #[error("No ACK after {attempts} sends")]
    AckTimeout { attempts: usize },

    #[error("NAK received on all {attempts} sends")]
    NakOverLimit { attempts: usize },

    #[error("Reply timeout")]
    ReplyTimeout,

    #[error("Reply truncated: expected {expected} bytes, got {actual} bytes")]
    ShortReply { expected: usize, actual: usize },

    #[error("Reply length {0} exceeds frame limit")]
    ReplyTooLarge(usize),

    #[error("Failed to receive a valid reply after {attempts} attempts")]
    FailedToReceiveReply { attempts: usize },

    #[error("Command canceled")]
    CommandCanceled,

    #[error("Cancel echo not received")]
    CancelTimeout,

    #[error("Malformed reply: {0}")]
    Frame(#[from] magstripe_core::Error),

    #[error("Connection closed by device")]
    ConnectionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Check if the command may simply be sent again
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::AckTimeout { .. } | Self::NakOverLimit { .. })
    }

    /// Check if error requires reconnection
    pub fn requires_reconnect(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::ConnectionClosed | Self::Io(_)
        )
    }

    /// Numeric failure code
    ///
    /// `AckTimeout` and `NakOverLimit` return their sentinel values; every
    /// other failure is `-(n + 10000)` so it never collides with a device
    /// error code.
    pub fn code(&self) -> i32 {
        let n = match self {
            Self::AckTimeout { .. } => return status::ACK_TIMEOUT,
            Self::NakOverLimit { .. } => return status::NAK_OVER_LIMIT,
            Self::NotConnected => 1,
            Self::AlreadyConnected => 2,
            Self::InvalidBaudRate(_) => 3,
            Self::PortOpenFailed { .. } => 4,
            Self::ReplyTimeout => 5,
            Self::ShortReply { .. } => 6,
            Self::ReplyTooLarge(_) => 7,
            Self::FailedToReceiveReply { .. } => 8,
            Self::CommandCanceled => 9,
            Self::CancelTimeout => 10,
            Self::Frame(_) => 11,
            Self::ConnectionClosed => 12,
            Self::Io(_) => 13,
        };
        -(n + status::TRANSPORT_OFFSET)
    }
}
