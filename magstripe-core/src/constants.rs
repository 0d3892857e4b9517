//! Protocol constants

use std::time::Duration;

/// Wire control bytes
pub mod control {
    /// Start of a frame
    pub const STX: u8 = 0xF2;

    /// Positive acknowledgment
    pub const ACK: u8 = 0x06;

    /// Negative acknowledgment
    pub const NAK: u8 = 0x15;

    /// First byte of a cancel request or its echo
    pub const DLE: u8 = 0x10;

    /// Second byte of a cancel request or its echo
    pub const EOT: u8 = 0x04;
}

/// Frame format tags (byte following the length field)
pub mod tag {
    /// Host-to-reader command
    pub const COMMAND: u8 = b'C';

    /// Positive reply, followed by a status digit pair
    pub const POSITIVE: u8 = b'P';

    /// Negative reply, followed by an error digit pair
    pub const NEGATIVE: u8 = b'N';

    /// Command could not be served by the reader
    pub const UNAVAILABLE: u8 = b'E';
}

/// Time to wait for the ACK/NAK byte after each send
pub const ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Time `cancel` waits for the DLE/EOT echo
pub const CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace period for the one extra read of a truncated reply
pub const SHORT_REPLY_GRACE: Duration = Duration::from_millis(500);

/// Default reply timeout for short commands
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Resends after the first attempt when ACK is missing or NAK received
pub const MAX_SEND_RETRIES: usize = 3;

/// Re-receives after the first attempt when the reply CRC is bad
pub const MAX_RECEIVE_RETRIES: usize = 3;

/// Maximum command/reply data length
pub const MAX_DATA_SIZE: usize = 1024;

/// Baud rates the reader accepts
pub const SUPPORTED_BAUD_RATES: [u32; 4] = [9600, 19200, 38400, 115200];

/// Reply codes with a fixed meaning across commands
pub mod status {
    /// Firmware query issued in the wrong CPU mode
    pub const NOT_SUPPORTED: i32 = 1;

    /// Sentinel: ACK never arrived within the send retry limit
    pub const ACK_TIMEOUT: i32 = -9001;

    /// Sentinel: reader NAKed every send within the retry limit
    pub const NAK_OVER_LIMIT: i32 = -9002;

    /// Reader answered with an `Unavailable` frame
    pub const UNAVAILABLE: i32 = -9003;

    /// Reply payload does not have the length the operation requires
    pub const BAD_REPLY_PAYLOAD: i32 = -9004;

    /// Offset applied to other transport failure codes: `-(code + OFFSET)`
    pub const TRANSPORT_OFFSET: i32 = 10000;
}
