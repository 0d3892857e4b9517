//! Mutual authentication with the reader's secure CPU
//!
//! ```text
//! host                                        reader
//!  │ SEND_KE_KEY   E_Km(Ke)                     │
//!  │──────────────────────────────────────────▶│
//!  │ SEND_KWA_KEY  E_Ke(Kwa)                    │
//!  │──────────────────────────────────────────▶│
//!  │ GET_CHALLENGE                              │
//!  │──────────────────────────────────────────▶│
//!  │                          E_Kwa(RndA) (16)  │
//!  │◀──────────────────────────────────────────│
//!  │ DEVICE_AUTH   E_Kwa(B0 A0 B1 A1 … B15 A15) │
//!  │──────────────────────────────────────────▶│
//!  │                   E_Kwa(RndB' …) (32)      │
//!  │◀──────────────────────────────────────────│
//! ```
//!
//! The reader is genuine only if `RndB' == RndB`.

use magstripe_core::{
    constants::status,
    crypto::{random_bytes, KEY_SIZE},
    DesKey, Operation,
};
use tracing::warn;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Random number length used on both sides
pub const RND_SIZE: usize = 16;

/// One authentication attempt's ephemeral material
pub(crate) struct Handshake {
    ke: DesKey,
    kwa: DesKey,
    rnd_b: Zeroizing<[u8; RND_SIZE]>,
}

impl Handshake {
    /// Generate Ke, Kwa and RndB
    pub fn new() -> Result<Self> {
        Ok(Self {
            ke: DesKey::generate()?,
            kwa: DesKey::generate()?,
            rnd_b: Zeroizing::new(random_bytes()),
        })
    }

    /// `SEND_KE_KEY` payload: Ke under the master key
    pub fn ke_payload(&self, master: &DesKey) -> Result<[u8; KEY_SIZE]> {
        Ok(master.wrap(&self.ke)?)
    }

    /// `SEND_KWA_KEY` payload: Kwa under Ke
    pub fn kwa_payload(&self) -> Result<[u8; KEY_SIZE]> {
        Ok(self.ke.wrap(&self.kwa)?)
    }

    /// `DEVICE_AUTH` payload for the reader's encrypted challenge
    pub fn respond(&self, challenge: &[u8]) -> Result<[u8; 2 * RND_SIZE]> {
        let mut rnd_a: Zeroizing<[u8; RND_SIZE]> =
            Zeroizing::new(<[u8; RND_SIZE]>::try_from(challenge).map_err(|_| Error::Rejected {
                operation: Operation::GetChallenge,
                code: status::BAD_REPLY_PAYLOAD,
            })?);
        self.kwa.decrypt_ecb(&mut rnd_a[..])?;

        let mut response = interleave(&self.rnd_b, &rnd_a);
        self.kwa.encrypt_ecb(&mut response)?;
        Ok(response)
    }

    /// Check the reader's echo of RndB
    pub fn verify(&self, echo: &[u8]) -> Result<()> {
        let mut rnd_b: Zeroizing<[u8; RND_SIZE]> = Zeroizing::new(
            echo.get(..RND_SIZE)
                .and_then(|head| <[u8; RND_SIZE]>::try_from(head).ok())
                .ok_or(Error::Rejected {
                    operation: Operation::DeviceAuth,
                    code: status::BAD_REPLY_PAYLOAD,
                })?,
        );
        self.kwa.decrypt_ecb(&mut rnd_b[..])?;

        if !constant_time_eq(&rnd_b[..], &self.rnd_b[..]) {
            warn!("Reader returned a wrong RndB");
            return Err(Error::AuthenticationFailed);
        }
        Ok(())
    }
}

/// `b[0], a[0], b[1], a[1], …`
pub fn interleave(b: &[u8; RND_SIZE], a: &[u8; RND_SIZE]) -> [u8; 2 * RND_SIZE] {
    let mut out = [0u8; 2 * RND_SIZE];
    for (i, (x, y)) in b.iter().zip(a).enumerate() {
        out[2 * i] = *x;
        out[2 * i + 1] = *y;
    }
    out
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
