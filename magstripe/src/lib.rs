//! # magstripe
//!
//! Host-side driver for secure magnetic-stripe card readers speaking the
//! 8-bit STX/CRC protocol over RS-232C.
//!
//! ## Features
//!
//! - Framed command/reply transport with ACK/NAK retries and DLE EOT cancel
//! - Mutual authentication with the reader's secure CPU (2-key Triple-DES)
//! - Per-track key ladders and CBC track decryption
//! - Master key commissioning with a local backup
//! - Async/await API using Tokio
//!
//! ## Quick Start
//!
//! ```no_run
//! use magstripe::{CardDetails, Reader, ReaderConfig, TrackSelection};
//!
//! #[tokio::main]
//! async fn main() -> magstripe::Result<()> {
//!     let mut reader = Reader::new(ReaderConfig::from_env()?);
//!     reader.connect().await?;
//!
//!     let info = reader.device_info().await?;
//!     println!("{}", info);
//!
//!     reader.authenticate().await?;
//!     let tracks = reader.read_tracks(TrackSelection::TRACK_1 | TrackSelection::TRACK_2).await?;
//!
//!     if let Ok(card) = CardDetails::from_tracks(&tracks) {
//!         println!("{} expires {}", card.masked_pan(), card.expiry);
//!     }
//!
//!     reader.disconnect().await?;
//!     Ok(())
//! }
//! ```

mod auth;
pub mod codec;
mod commission;
pub mod config;
pub mod error;
pub mod reader;
mod tracks;

// Re-exports
pub use commission::read_backup;
pub use config::{FactoryKeys, ReaderClass, ReaderConfig};
pub use error::{Error, Result};
pub use reader::{CancelHandle, LedMode, Reader};

pub use magstripe_core::{DesKey, Operation, Reply, Session, SessionState};
pub use magstripe_transport::{CancelOutcome, Connector, DuplexConnector, SerialConnector};
pub use magstripe_types::{
    CardDetails, DeviceInfo, FirmwareVersions, TrackData, TrackNumber, TrackSelection, TrackSet, TrackStatus,
};
