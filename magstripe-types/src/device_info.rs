//! Device information structures

use std::fmt;

/// Firmware versions reported by the reader's CPUs
///
/// A field is `None` when the reader answers "not supported" for it, which
/// is normal for readers without a secure CPU or EMV module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareVersions {
    /// Main CPU supervisor firmware
    pub super_cpu: Option<String>,

    /// Main CPU user firmware
    pub user: Option<String>,

    /// EMV2000 module firmware
    pub emv2000: Option<String>,

    /// Secure CPU supervisor firmware
    pub sec_super: Option<String>,

    /// Secure CPU user firmware
    pub sec_user: Option<String>,
}

impl FirmwareVersions {
    /// Check if the reader has a secure CPU
    pub fn has_secure_cpu(&self) -> bool {
        self.sec_super.is_some() || self.sec_user.is_some()
    }
}

/// Device information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Device serial number
    pub serial_number: String,

    /// Device model
    pub model: String,

    /// Firmware versions
    pub firmware: FirmwareVersions,
}

impl DeviceInfo {
    pub fn new(serial_number: String, model: String) -> Self {
        Self {
            serial_number,
            model,
            firmware: FirmwareVersions::default(),
        }
    }

    pub fn with_firmware(mut self, firmware: FirmwareVersions) -> Self {
        self.firmware = firmware;
        self
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reader[SN: {}, Model: {}", self.serial_number, self.model)?;
        if let Some(user) = &self.firmware.user {
            write!(f, ", FW: {}", user)?;
        }
        if let Some(sec_user) = &self.firmware.sec_user {
            write!(f, ", SEC: {}", sec_user)?;
        }
        write!(f, "]")
    }
}

/// Decode an ASCII info field, dropping NUL padding and trailing blanks
pub fn ascii_field(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim_end().to_string()
}
