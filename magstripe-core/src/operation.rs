//! Reader operation table
//!
//! Every logical operation maps to a fixed command/parameter byte pair. The
//! table is a `const` match, so no code strings are built at call time.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;

use crate::{
    constants::MAX_DATA_SIZE,
    error::{Error, Result},
    frame::CommandFrame,
};

/// Logical reader operations
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Operation {
    // Mechanism
    Init,
    Reset,
    Intake,
    Withdraw,
    Led,
    CancelCommand,

    // Magnetic tracks
    ReadTrack1,
    ReadTrack2,
    ReadTrack3,

    // Security module
    ImportMasterKey,
    SendKeKey,
    SendKwaKey,
    GetChallenge,
    DeviceAuth,
    SendMagDataKe,
    SendMagDataKey,
    ZapReaderLock,

    // Device information
    InfoSerialNumber,
    InfoModel,
    FirmwareSuper,
    FirmwareUser,
    FirmwareEmv2000,
    FirmwareSecSuper,
    FirmwareSecUser,
}

/// Request payload shape accepted by an operation
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PayloadRule {
    /// No request data
    Empty,
    /// Exactly this many bytes
    Exact(usize),
    /// 8-digit ASCII millisecond timeout
    Timeout,
    /// Any length up to the frame limit
    Any,
}

impl Operation {
    /// All operations, in table order
    pub const ALL: [Operation; 24] = [
        Self::Init,
        Self::Reset,
        Self::Intake,
        Self::Withdraw,
        Self::Led,
        Self::CancelCommand,
        Self::ReadTrack1,
        Self::ReadTrack2,
        Self::ReadTrack3,
        Self::ImportMasterKey,
        Self::SendKeKey,
        Self::SendKwaKey,
        Self::GetChallenge,
        Self::DeviceAuth,
        Self::SendMagDataKe,
        Self::SendMagDataKey,
        Self::ZapReaderLock,
        Self::InfoSerialNumber,
        Self::InfoModel,
        Self::FirmwareSuper,
        Self::FirmwareUser,
        Self::FirmwareEmv2000,
        Self::FirmwareSecSuper,
        Self::FirmwareSecUser,
    ];

    /// Command and parameter bytes sent on the wire
    pub const fn code(self) -> (u8, u8) {
        match self {
            Self::Init => (0x30, 0x30),
            Self::Reset => (0x30, 0x31),
            Self::Intake => (0x3A, 0x30),
            Self::Withdraw => (0x3A, 0x31),
            Self::Led => (0x35, 0x30),
            Self::CancelCommand => (0x40, 0x30),
            Self::ReadTrack1 => (0x36, 0x31),
            Self::ReadTrack2 => (0x36, 0x32),
            Self::ReadTrack3 => (0x36, 0x33),
            Self::ImportMasterKey => (0x47, 0x30),
            Self::SendKeKey => (0x47, 0x31),
            Self::SendKwaKey => (0x47, 0x32),
            Self::GetChallenge => (0x47, 0x33),
            Self::DeviceAuth => (0x47, 0x34),
            Self::SendMagDataKe => (0x47, 0x35),
            Self::SendMagDataKey => (0x47, 0x36),
            Self::ZapReaderLock => (0x47, 0x37),
            Self::InfoSerialNumber => (0x41, 0x30),
            Self::InfoModel => (0x41, 0x31),
            Self::FirmwareSuper => (0x41, 0x32),
            Self::FirmwareUser => (0x41, 0x33),
            Self::FirmwareEmv2000 => (0x41, 0x34),
            Self::FirmwareSecSuper => (0x41, 0x35),
            Self::FirmwareSecUser => (0x41, 0x36),
        }
    }

    /// Request payload accepted by this operation
    pub const fn payload_rule(self) -> PayloadRule {
        match self {
            Self::Intake | Self::Withdraw => PayloadRule::Timeout,
            Self::Led => PayloadRule::Exact(1),
            Self::ImportMasterKey | Self::SendKeKey | Self::SendKwaKey | Self::SendMagDataKe => {
                PayloadRule::Exact(16)
            }
            Self::SendMagDataKey => PayloadRule::Exact(24),
            Self::DeviceAuth => PayloadRule::Exact(32),
            Self::ZapReaderLock => PayloadRule::Any,
            _ => PayloadRule::Empty,
        }
    }

    /// Reply payload length the operation requires, if fixed
    pub const fn reply_len(self) -> Option<usize> {
        match self {
            Self::GetChallenge => Some(16),
            Self::DeviceAuth => Some(32),
            _ => None,
        }
    }

    /// Track read operation for track `number` (1..=3)
    pub const fn read_track(number: u8) -> Option<Self> {
        match number {
            1 => Some(Self::ReadTrack1),
            2 => Some(Self::ReadTrack2),
            3 => Some(Self::ReadTrack3),
            _ => None,
        }
    }

    /// Check if this is a firmware version query
    pub fn is_firmware_query(self) -> bool {
        matches!(
            self,
            Self::FirmwareSuper
                | Self::FirmwareUser
                | Self::FirmwareEmv2000
                | Self::FirmwareSecSuper
                | Self::FirmwareSecUser
        )
    }

    /// Get operation name
    pub fn name(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Reset => "RESET",
            Self::Intake => "INTAKE",
            Self::Withdraw => "WITHDRAW",
            Self::Led => "LED",
            Self::CancelCommand => "CANCEL_COMMAND",
            Self::ReadTrack1 => "READ_TRACK_1",
            Self::ReadTrack2 => "READ_TRACK_2",
            Self::ReadTrack3 => "READ_TRACK_3",
            Self::ImportMasterKey => "IMPORT_MASTER_KEY",
            Self::SendKeKey => "SEND_KE_KEY",
            Self::SendKwaKey => "SEND_KWA_KEY",
            Self::GetChallenge => "GET_CHALLENGE",
            Self::DeviceAuth => "DEVICE_AUTH",
            Self::SendMagDataKe => "SEND_MAG_DATA_KE",
            Self::SendMagDataKey => "SEND_MAG_DATA_KEY",
            Self::ZapReaderLock => "ZAP_READER_LOCK",
            Self::InfoSerialNumber => "INFO_SERIAL_NUMBER",
            Self::InfoModel => "INFO_MODEL",
            Self::FirmwareSuper => "FW_SUPER",
            Self::FirmwareUser => "FW_USER",
            Self::FirmwareEmv2000 => "FW_EMV2000",
            Self::FirmwareSecSuper => "FW_SEC_SUPER",
            Self::FirmwareSecUser => "FW_SEC_USER",
        }
    }

    /// Build the command frame for this operation
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPayload`] when `payload` does not match the
    /// operation's [`PayloadRule`].
    ///
    /// # Examples
    ///
    /// ```
    /// use magstripe_core::Operation;
    ///
    /// let frame = Operation::ReadTrack2.encode(Vec::new()).unwrap();
    /// assert_eq!((frame.command_code, frame.parameter_code), (0x36, 0x32));
    /// ```
    pub fn encode(self, payload: impl Into<Bytes>) -> Result<CommandFrame> {
        let payload = payload.into();
        let actual = payload.len();

        let expected = match self.payload_rule() {
            PayloadRule::Empty if actual != 0 => Some("no data"),
            PayloadRule::Exact(16) if actual != 16 => Some("16 bytes"),
            PayloadRule::Exact(24) if actual != 24 => Some("24 bytes"),
            PayloadRule::Exact(32) if actual != 32 => Some("32 bytes"),
            PayloadRule::Exact(n) if actual != n => Some("fixed length"),
            PayloadRule::Timeout if actual != 8 || !payload.iter().all(u8::is_ascii_digit) => {
                Some("8 ASCII digits")
            }
            _ => None,
        };
        if let Some(expected) = expected {
            return Err(Error::InvalidPayload {
                operation: self,
                expected,
                actual,
            });
        }
        if actual > MAX_DATA_SIZE {
            return Err(Error::PayloadTooLarge {
                size: actual,
                max: MAX_DATA_SIZE,
            });
        }

        let (command_code, parameter_code) = self.code();
        Ok(CommandFrame::with_payload(command_code, parameter_code, payload))
    }

    /// Encode a timeout as the 8-digit zero-padded millisecond payload
    ///
    /// Values above 99 999 999 ms saturate.
    pub fn timeout_payload(timeout: Duration) -> Bytes {
        let millis = timeout.as_millis().min(99_999_999);
        Bytes::from(format!("{:08}", millis))
    }
}

impl TryFrom<(u8, u8)> for Operation {
    type Error = Error;

    fn try_from((command, parameter): (u8, u8)) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|op| op.code() == (command, parameter))
            .ok_or(Error::UnknownCommand(command, parameter))
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (command, parameter) = self.code();
        write!(f, "{}({:02X}{:02X})", self.name(), command, parameter)
    }
}
