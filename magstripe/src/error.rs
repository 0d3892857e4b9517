//! High-level error types

use magstripe_core::{constants::status, Operation};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Core protocol error: {0}")]
    Core(#[from] magstripe_core::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] magstripe_transport::Error),

    #[error("Type error: {0}")]
    Types(#[from] magstripe_types::Error),

    #[error("{operation} rejected by reader (code {code})")]
    Rejected { operation: Operation, code: i32 },

    #[error("Reader failed challenge verification")]
    AuthenticationFailed,

    #[error("Reader not authenticated")]
    NotAuthenticated,

    #[error("Reader not connected")]
    NotConnected,

    #[error("Operation needs explicit confirmation")]
    ConfirmationRequired,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if re-sending the same command may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_retryable())
    }

    /// Numeric outcome for codec-level failures, if any
    ///
    /// Reader rejections give the negative reply code; transport failures
    /// give their sentinel or `-(n + 10000)` code.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Rejected { code, .. } => Some(*code),
            Self::Transport(e) => Some(e.code()),
            _ => None,
        }
    }

    /// Check if the reader reported the operation as unsupported
    pub fn is_not_supported(&self) -> bool {
        matches!(self, Self::Rejected { code, .. } if *code == -status::NOT_SUPPORTED)
    }
}
