//! Track key ladder and decryption
//!
//! Every track read gets its own ladder: a fresh Ke under Km, then a fresh
//! Kwm and IV under Ke. The reader encrypts the track in CBC mode under
//! Kwm; the plaintext ends at `0x80`.

use magstripe_core::{
    crypto::{Iv, BLOCK_SIZE, KEY_SIZE},
    DesKey, Operation,
};
use magstripe_types::{TrackData, TrackNumber, TrackStatus};
use tracing::debug;
use zeroize::Zeroizing;

use crate::codec::Decoded;
use crate::error::{Error, Result};

/// `SEND_MAG_DATA_KEY` payload size: Kwm || IV
pub const KWM_PAYLOAD_SIZE: usize = KEY_SIZE + BLOCK_SIZE;

/// Per-read key material
pub(crate) struct TrackLadder {
    ke: DesKey,
    kwm: DesKey,
    iv: Iv,
}

impl TrackLadder {
    pub fn new() -> Result<Self> {
        Ok(Self {
            ke: DesKey::generate()?,
            kwm: DesKey::generate()?,
            iv: [0u8; BLOCK_SIZE],
        })
    }

    /// `SEND_MAG_DATA_KE` payload: Ke under the master key
    pub fn ke_payload(&self, master: &DesKey) -> Result<[u8; KEY_SIZE]> {
        Ok(master.wrap(&self.ke)?)
    }

    /// `SEND_MAG_DATA_KEY` payload: `E_Ke(Kwm || IV)`
    pub fn kwm_payload(&self) -> Result<Zeroizing<[u8; KWM_PAYLOAD_SIZE]>> {
        let mut payload = Zeroizing::new([0u8; KWM_PAYLOAD_SIZE]);
        payload[..KEY_SIZE].copy_from_slice(self.kwm.as_bytes());
        payload[KEY_SIZE..].copy_from_slice(&self.iv);
        self.ke.encrypt_ecb(&mut payload[..])?;
        Ok(payload)
    }

    /// Interpret a `READ_TRACK_n` outcome
    ///
    /// Status 0 with data is decrypted. Status codes 20..=27, positive or
    /// negative, mean the track is absent. Anything else is a rejection.
    pub fn track_result(&self, track: TrackNumber, outcome: std::result::Result<Decoded, i32>) -> Result<TrackData> {
        let operation = read_operation(track);

        match outcome {
            Ok(decoded) if decoded.status == 0 => {
                if decoded.payload.is_empty() {
                    return Ok(TrackData::absent(track, TrackStatus::NoData));
                }
                self.decrypt(track, &decoded.payload)
            }
            Ok(decoded) => absent(track, operation, decoded.status),
            Err(code) => absent(track, operation, code),
        }
    }

    fn decrypt(&self, track: TrackNumber, ciphertext: &[u8]) -> Result<TrackData> {
        let mut plaintext = Zeroizing::new(ciphertext.to_vec());
        self.kwm.decrypt_cbc(&self.iv, &mut plaintext[..])?;

        let data = TrackData::from_plaintext(track, TrackStatus::Ok, &plaintext)?;
        debug!("{}: {} bytes", track, data.len());
        Ok(data)
    }
}

/// Read operation for `track`
pub fn read_operation(track: TrackNumber) -> Operation {
    match track {
        TrackNumber::One => Operation::ReadTrack1,
        TrackNumber::Two => Operation::ReadTrack2,
        TrackNumber::Three => Operation::ReadTrack3,
    }
}

fn absent(track: TrackNumber, operation: Operation, code: i32) -> Result<TrackData> {
    match TrackStatus::from_code(code) {
        Ok(track_status) if !track_status.is_ok() => {
            debug!("{}: {}", track, track_status);
            Ok(TrackData::absent(track, track_status))
        }
        _ => Err(Error::Rejected { operation, code }),
    }
}
