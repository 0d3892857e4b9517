//! Command and reply frame encoding/decoding

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

use crate::{
    constants::{control, status, tag, MAX_DATA_SIZE},
    crc,
    error::{Error, Result},
    operation::Operation,
};

/// Bytes preceding the body: STX + 2-byte length
pub const HEADER_SIZE: usize = 3;

/// Trailing CRC size
pub const CRC_SIZE: usize = 2;

/// Largest body a reply may declare (tag, echo, status and data)
pub const MAX_BODY_SIZE: usize = 5 + MAX_DATA_SIZE;

/// Host-to-reader command frame
///
/// # Frame Structure
///
/// ```text
/// ┌─────┬─────────┬─────┬─────┬───────┬──────────┬─────────┐
/// │ STX │ Length  │ Tag │ Cmd │ Param │   Data   │  CRC    │
/// │ F2  │ 2 bytes │ 'C' │  1  │   1   │ N bytes  │ 2 bytes │
/// │     │ (BE)    │     │     │       │          │ (BE)    │
/// └─────┴─────────┴─────┴─────┴───────┴──────────┴─────────┘
/// ```
///
/// `Length` = N + 3. The CRC covers everything from the length field to the
/// end of the data.
///
/// # Examples
///
/// ```
/// use magstripe_core::CommandFrame;
///
/// let frame = CommandFrame::new(0x30, 0x30);
/// let encoded = frame.encode();
/// assert_eq!(encoded.len(), 8);
///
/// let decoded = CommandFrame::decode(&encoded).unwrap();
/// assert_eq!(frame, decoded);
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct CommandFrame {
    /// Command byte
    pub command_code: u8,

    /// Parameter byte
    pub parameter_code: u8,

    /// Command data
    pub payload: Bytes,
}

impl CommandFrame {
    /// Create a command frame with no data
    pub fn new(command_code: u8, parameter_code: u8) -> Self {
        Self {
            command_code,
            parameter_code,
            payload: Bytes::new(),
        }
    }

    /// Create a command frame with data
    ///
    /// The size is not checked here; `Operation::encode` and the port reject
    /// payloads above `MAX_DATA_SIZE`.
    pub fn with_payload(command_code: u8, parameter_code: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            command_code,
            parameter_code,
            payload: payload.into(),
        }
    }

    /// Operation matching this frame's code pair, if known
    pub fn operation(&self) -> Option<Operation> {
        Operation::try_from((self.command_code, self.parameter_code)).ok()
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> BytesMut {
        let len = 3 + self.payload.len();
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + len + CRC_SIZE);

        buf.put_u8(control::STX);
        buf.put_u16(len as u16);
        buf.put_u8(tag::COMMAND);
        buf.put_u8(self.command_code);
        buf.put_u8(self.parameter_code);
        buf.put_slice(&self.payload);

        let crc = checksum(&buf);
        buf.put_u16(crc);

        buf
    }

    /// Decode a complete command frame
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is truncated, its start byte, tag or
    /// length is wrong, or the CRC does not match.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let body = split_frame(frame)?;

        if body.len() < 3 {
            return Err(Error::FrameTooShort {
                expected: HEADER_SIZE + 3 + CRC_SIZE,
                actual: frame.len(),
            });
        }
        if body[0] != tag::COMMAND {
            return Err(Error::UnknownTag(body[0]));
        }

        Ok(Self::with_payload(
            body[1],
            body[2],
            Bytes::copy_from_slice(&body[3..]),
        ))
    }
}

impl fmt::Debug for CommandFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandFrame")
            .field("command_code", &format!("0x{:02X}", self.command_code))
            .field("parameter_code", &format!("0x{:02X}", self.parameter_code))
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

impl fmt::Display for CommandFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operation() {
            Some(op) => write!(f, "Command[{}](len={})", op, self.payload.len()),
            None => write!(
                f,
                "Command[{:02X}{:02X}](len={})",
                self.command_code,
                self.parameter_code,
                self.payload.len()
            ),
        }
    }
}

/// Two ASCII decimal digits carried by positive and negative replies
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct StatusDigits(u8, u8);

impl StatusDigits {
    /// Validate a digit pair
    pub fn new(tens: u8, ones: u8) -> Result<Self> {
        if tens.is_ascii_digit() && ones.is_ascii_digit() {
            Ok(Self(tens, ones))
        } else {
            Err(Error::InvalidStatus(tens, ones))
        }
    }

    /// Build from a decimal value (0..=99)
    pub fn from_value(value: u8) -> Self {
        let value = value.min(99);
        Self(b'0' + value / 10, b'0' + value % 10)
    }

    /// Decimal value: tens × 10 + ones
    pub fn value(self) -> u8 {
        (self.0 - b'0') * 10 + (self.1 - b'0')
    }

    /// Raw ASCII bytes
    pub fn bytes(self) -> [u8; 2] {
        [self.0, self.1]
    }
}

/// Reader-to-host reply
///
/// # Frame Structure
///
/// ```text
/// ┌─────┬─────────┬─────┬─────┬───────┬────────────┬──────────┬─────────┐
/// │ STX │ Length  │ Tag │ Cmd │ Param │ St1 │ St2  │   Data   │  CRC    │
/// │ F2  │ 2 bytes │P/N/E│  1  │   1   │ 2 ASCII    │ N bytes  │ 2 bytes │
/// └─────┴─────────┴─────┴─────┴───────┴────────────┴──────────┴─────────┘
/// ```
///
/// `Length` = N + 5 for positive and negative replies. An `Unavailable`
/// reply carries only the tag (any trailing bytes are ignored).
#[derive(Clone, PartialEq, Eq)]
pub enum Reply {
    /// Command executed
    Positive {
        command_code: u8,
        parameter_code: u8,
        status: StatusDigits,
        payload: Bytes,
    },

    /// Command rejected
    Negative {
        command_code: u8,
        parameter_code: u8,
        error: StatusDigits,
        payload: Bytes,
    },

    /// Reader cannot serve the command
    Unavailable,
}

impl Reply {
    /// Create a positive reply
    pub fn positive(command_code: u8, parameter_code: u8, status: u8, payload: impl Into<Bytes>) -> Self {
        Self::Positive {
            command_code,
            parameter_code,
            status: StatusDigits::from_value(status),
            payload: payload.into(),
        }
    }

    /// Create a negative reply
    pub fn negative(command_code: u8, parameter_code: u8, error: u8, payload: impl Into<Bytes>) -> Self {
        Self::Negative {
            command_code,
            parameter_code,
            error: StatusDigits::from_value(error),
            payload: payload.into(),
        }
    }

    /// Signed outcome: `+status` for positive, `-error` for negative
    pub fn status_code(&self) -> i32 {
        match self {
            Self::Positive { status, .. } => status.value() as i32,
            Self::Negative { error, .. } => -(error.value() as i32),
            Self::Unavailable => status::UNAVAILABLE,
        }
    }

    /// Check if this is a positive reply
    pub fn is_positive(&self) -> bool {
        matches!(self, Self::Positive { .. })
    }

    /// Echoed command/parameter pair
    pub fn echo(&self) -> Option<(u8, u8)> {
        match self {
            Self::Positive { command_code, parameter_code, .. }
            | Self::Negative { command_code, parameter_code, .. } => {
                Some((*command_code, *parameter_code))
            }
            Self::Unavailable => None,
        }
    }

    /// Reply data (empty for `Unavailable`)
    pub fn payload(&self) -> Bytes {
        match self {
            Self::Positive { payload, .. } | Self::Negative { payload, .. } => payload.clone(),
            Self::Unavailable => Bytes::new(),
        }
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> BytesMut {
        let (tag, body) = match self {
            Self::Positive { command_code, parameter_code, status, payload } => {
                (tag::POSITIVE, Some((*command_code, *parameter_code, *status, payload)))
            }
            Self::Negative { command_code, parameter_code, error, payload } => {
                (tag::NEGATIVE, Some((*command_code, *parameter_code, *error, payload)))
            }
            Self::Unavailable => (tag::UNAVAILABLE, None),
        };

        let len = 1 + body.map_or(0, |(_, _, _, payload)| 4 + payload.len());
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + len + CRC_SIZE);

        buf.put_u8(control::STX);
        buf.put_u16(len as u16);
        buf.put_u8(tag);
        if let Some((command_code, parameter_code, digits, payload)) = body {
            buf.put_u8(command_code);
            buf.put_u8(parameter_code);
            buf.put_slice(&digits.bytes());
            buf.put_slice(payload);
        }

        let crc = checksum(&buf);
        buf.put_u16(crc);

        buf
    }

    /// Decode a complete reply frame
    ///
    /// Data length is `declared − 1 (tag) − 2 (echo) − 2 (status)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is truncated, the CRC does not match,
    /// the tag is unknown or the status digits are not ASCII decimal.
    ///
    /// # Examples
    ///
    /// ```
    /// use magstripe_core::Reply;
    ///
    /// let reply = Reply::positive(0x36, 0x31, 25, vec![0xAA; 8]);
    /// let decoded = Reply::decode(&reply.encode()).unwrap();
    /// assert_eq!(decoded.status_code(), 25);
    /// ```
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let body = split_frame(frame)?;

        let Some(&tag) = body.first() else {
            return Err(Error::FrameTooShort {
                expected: HEADER_SIZE + 1 + CRC_SIZE,
                actual: frame.len(),
            });
        };

        if tag == tag::UNAVAILABLE {
            return Ok(Self::Unavailable);
        }
        if tag != tag::POSITIVE && tag != tag::NEGATIVE {
            return Err(Error::UnknownTag(tag));
        }
        if body.len() < 5 {
            return Err(Error::FrameTooShort {
                expected: HEADER_SIZE + 5 + CRC_SIZE,
                actual: frame.len(),
            });
        }

        let command_code = body[1];
        let parameter_code = body[2];
        let digits = StatusDigits::new(body[3], body[4])?;
        let payload = Bytes::copy_from_slice(&body[5..]);

        Ok(if tag == tag::POSITIVE {
            Self::Positive { command_code, parameter_code, status: digits, payload }
        } else {
            Self::Negative { command_code, parameter_code, error: digits, payload }
        })
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Positive { command_code, parameter_code, status, payload } => f
                .debug_struct("Positive")
                .field("echo", &format!("{:02X}{:02X}", command_code, parameter_code))
                .field("status", &status.value())
                .field("payload_len", &payload.len())
                .finish(),
            Self::Negative { command_code, parameter_code, error, payload } => f
                .debug_struct("Negative")
                .field("echo", &format!("{:02X}{:02X}", command_code, parameter_code))
                .field("error", &error.value())
                .field("payload_len", &payload.len())
                .finish(),
            Self::Unavailable => f.write_str("Unavailable"),
        }
    }
}

/// Declared body length from the 3 header bytes (STX, len_hi, len_lo)
pub fn declared_len(header: &[u8; HEADER_SIZE]) -> Result<usize> {
    if header[0] != control::STX {
        return Err(Error::InvalidStart(header[0]));
    }
    Ok(BigEndian::read_u16(&header[1..3]) as usize)
}

/// CRC over a frame without its trailing CRC (STX excluded)
fn checksum(frame_without_crc: &[u8]) -> u16 {
    let header = crc::crc16(crc::INITIAL, &frame_without_crc[1..HEADER_SIZE]);
    crc::crc16(header, &frame_without_crc[HEADER_SIZE..])
}

/// Validate framing and CRC, returning the body (tag through data)
fn split_frame(frame: &[u8]) -> Result<&[u8]> {
    if frame.len() < HEADER_SIZE + CRC_SIZE {
        return Err(Error::FrameTooShort {
            expected: HEADER_SIZE + CRC_SIZE,
            actual: frame.len(),
        });
    }

    let header: &[u8; HEADER_SIZE] = frame[..HEADER_SIZE]
        .try_into()
        .map_err(|_| Error::FrameTooShort { expected: HEADER_SIZE, actual: frame.len() })?;
    let declared = declared_len(header)?;
    let actual = frame.len() - HEADER_SIZE - CRC_SIZE;
    if declared != actual {
        return Err(Error::LengthMismatch { declared, actual });
    }

    let crc_at = frame.len() - CRC_SIZE;
    let received = BigEndian::read_u16(&frame[crc_at..]);
    if !crc::verify(&frame[1..crc_at], received) {
        return Err(Error::CrcMismatch {
            expected: checksum(&frame[..crc_at]),
            received,
        });
    }

    Ok(&frame[HEADER_SIZE..crc_at])
}
