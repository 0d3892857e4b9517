//! Transport layer for the reader's 8-bit protocol
//!
//! Provides the serial link and the framed command/reply state machine.

pub mod duplex;
pub mod error;
pub mod port;
pub mod serial;

pub use duplex::DuplexConnector;
pub use error::{Error, Result};
pub use port::{CancelOutcome, PortSession};
pub use serial::SerialConnector;

use std::fmt;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream to the reader
pub trait Link: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Link for T {}

/// Opens links to a reader
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open the device and flush pending input
    async fn open(&self, baud: BaudRate) -> Result<Box<dyn Link>>;

    /// Device name, for logs
    fn port_name(&self) -> String;
}

/// Baud rates accepted by the reader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaudRate {
    B9600,
    B19200,
    B38400,
    B115200,
}

impl BaudRate {
    /// Bits per second
    pub fn as_u32(self) -> u32 {
        match self {
            Self::B9600 => 9600,
            Self::B19200 => 19200,
            Self::B38400 => 38400,
            Self::B115200 => 115200,
        }
    }
}

impl Default for BaudRate {
    fn default() -> Self {
        Self::B38400
    }
}

impl TryFrom<u32> for BaudRate {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            9600 => Ok(Self::B9600),
            19200 => Ok(Self::B19200),
            38400 => Ok(Self::B38400),
            115200 => Ok(Self::B115200),
            _ => Err(Error::InvalidBaudRate(value)),
        }
    }
}

impl fmt::Display for BaudRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bps", self.as_u32())
    }
}
