//! # magstripe-core
//!
//! Core protocol implementation for secure magnetic-stripe card readers.
//!
//! This crate provides the low-level protocol primitives:
//! - Command and reply frame encoding/decoding
//! - CRC-16/CCITT calculation
//! - Operation table (logical operation → command/parameter bytes)
//! - DES key material and 2-key Triple-DES ciphers
//! - Protocol constants

pub mod constants;
pub mod crc;
pub mod crypto;
pub mod error;
pub mod frame;
pub mod operation;
pub mod session;

pub use crypto::DesKey;
pub use error::{Error, Result};
pub use frame::{CommandFrame, Reply, StatusDigits};
pub use operation::Operation;
pub use session::{Session, SessionState};
