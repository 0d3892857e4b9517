//! CRC-16/CCITT frame checksum
//!
//! Parameters used by the reader's 8-bit protocol:
//! 1. Polynomial 0x1021
//! 2. MSB-first, no input or output reflection
//! 3. No final XOR
//! 4. Seed 0x0000 for a fresh computation
//!
//! The seed argument makes the computation resumable, so a frame header and
//! its payload can be hashed in two steps.

use tracing::trace;

/// CCITT generator polynomial
pub const POLYNOMIAL: u16 = 0x1021;

/// Seed for a fresh computation
pub const INITIAL: u16 = 0x0000;

/// Calculate CRC-16/CCITT, continuing from `seed`
///
/// # Algorithm
///
/// ```text
/// for each byte:
///     crc ^= byte << 8
///     repeat 8 times:
///         crc = (crc & 0x8000) ? (crc << 1) ^ 0x1021 : crc << 1
/// ```
///
/// # Examples
///
/// ```
/// use magstripe_core::crc;
///
/// let whole = crc::crc16(0, b"123456789");
/// let split = crc::crc16(crc::crc16(0, b"1234"), b"56789");
/// assert_eq!(whole, split);
/// assert_eq!(whole, 0x31C3);
/// ```
pub fn crc16(seed: u16, bytes: &[u8]) -> u16 {
    let mut crc = seed;

    for &byte in bytes {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ POLYNOMIAL
            } else {
                crc << 1
            };
        }
    }

    trace!(
        seed = format!("0x{:04X}", seed),
        len = bytes.len(),
        crc = format!("0x{:04X}", crc),
        "Calculated CRC"
    );

    crc
}

/// Verify a CRC over `bytes`
pub fn verify(bytes: &[u8], expected: u16) -> bool {
    crc16(INITIAL, bytes) == expected
}
