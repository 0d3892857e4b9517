//! DES key material and 2-key Triple-DES primitives
//!
//! The reader's key hierarchy (Km, Ke, Kwa, Kwm) is built from 16-byte
//! 2-key 3DES keys, applied EDE with K1, K2, K1. Freshly generated keys are
//! odd-parity adjusted and screened against the DES weak and semi-weak key
//! tables before use.

use std::fmt;

use cipher::{
    generic_array::GenericArray, BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut,
    KeyInit, KeyIvInit,
};
use des::TdesEde2;
use rand::RngCore;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// DES block size
pub const BLOCK_SIZE: usize = 8;

/// 2-key 3DES key size
pub const KEY_SIZE: usize = 16;

/// CBC initialisation vector
pub type Iv = [u8; BLOCK_SIZE];

/// Attempts made by [`DesKey::generate`] before giving up
pub const MAX_GENERATE_ATTEMPTS: usize = 8;

/// Weak and semi-weak single-DES keys (parity adjusted)
const WEAK_KEYS: [[u8; 8]; 16] = [
    [0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01],
    [0xFE, 0xFE, 0xFE, 0xFE, 0xFE, 0xFE, 0xFE, 0xFE],
    [0xE0, 0xE0, 0xE0, 0xE0, 0xF1, 0xF1, 0xF1, 0xF1],
    [0x1F, 0x1F, 0x1F, 0x1F, 0x0E, 0x0E, 0x0E, 0x0E],
    [0x01, 0x1F, 0x01, 0x1F, 0x01, 0x0E, 0x01, 0x0E],
    [0x1F, 0x01, 0x1F, 0x01, 0x0E, 0x01, 0x0E, 0x01],
    [0x01, 0xE0, 0x01, 0xE0, 0x01, 0xF1, 0x01, 0xF1],
    [0xE0, 0x01, 0xE0, 0x01, 0xF1, 0x01, 0xF1, 0x01],
    [0x01, 0xFE, 0x01, 0xFE, 0x01, 0xFE, 0x01, 0xFE],
    [0xFE, 0x01, 0xFE, 0x01, 0xFE, 0x01, 0xFE, 0x01],
    [0x1F, 0xE0, 0x1F, 0xE0, 0x0E, 0xF1, 0x0E, 0xF1],
    [0xE0, 0x1F, 0xE0, 0x1F, 0xF1, 0x0E, 0xF1, 0x0E],
    [0x1F, 0xFE, 0x1F, 0xFE, 0x0E, 0xFE, 0x0E, 0xFE],
    [0xFE, 0x1F, 0xFE, 0x1F, 0xFE, 0x0E, 0xFE, 0x0E],
    [0xE0, 0xFE, 0xE0, 0xFE, 0xF1, 0xFE, 0xF1, 0xFE],
    [0xFE, 0xE0, 0xFE, 0xE0, 0xFE, 0xF1, 0xFE, 0xF1],
];

/// 2-key Triple-DES key
///
/// Zeroized on drop. `Debug` never prints key bytes.
///
/// # Examples
///
/// ```
/// use magstripe_core::crypto::DesKey;
///
/// let key = DesKey::generate().unwrap();
/// key.validate().unwrap();
///
/// let mut block = *b"RNDRNDRNDRNDRND!";
/// key.encrypt_ecb(&mut block).unwrap();
/// key.decrypt_ecb(&mut block).unwrap();
/// assert_eq!(&block, b"RNDRNDRNDRNDRND!");
/// ```
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct DesKey([u8; KEY_SIZE]);

impl DesKey {
    /// Wrap raw key bytes as-is
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Build a key from a slice
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::InvalidKey("key must be 16 bytes"))?;
        Ok(Self(bytes))
    }

    /// Parse a key from 32 hex characters
    pub fn from_hex(text: &str) -> Result<Self> {
        let mut bytes = hex::decode(text.trim())?;
        let key = Self::from_slice(&bytes);
        bytes.zeroize();
        key
    }

    /// Hex encoding of the key bytes
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Generate a fresh random key with odd parity
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyGeneration`] if no candidate passes
    /// [`validate`](Self::validate) within [`MAX_GENERATE_ATTEMPTS`].
    pub fn generate() -> Result<Self> {
        let mut rng = rand::rng();

        for attempt in 1..=MAX_GENERATE_ATTEMPTS {
            let mut bytes = [0u8; KEY_SIZE];
            rng.fill_bytes(&mut bytes);
            adjust_parity(&mut bytes);

            let key = Self(bytes);
            bytes.zeroize();

            match key.validate() {
                Ok(()) => return Ok(key),
                Err(e) => debug!(attempt, "Discarding generated key: {}", e),
            }
        }

        Err(Error::KeyGeneration {
            attempts: MAX_GENERATE_ATTEMPTS,
        })
    }

    /// Check parity, weak halves and distinct halves
    pub fn validate(&self) -> Result<()> {
        if !has_odd_parity(&self.0) {
            return Err(Error::InvalidKey("parity is not odd"));
        }

        let (k1, k2) = self.0.split_at(BLOCK_SIZE);
        if is_weak(k1) || is_weak(k2) {
            return Err(Error::InvalidKey("weak or semi-weak half"));
        }
        if k1 == k2 {
            return Err(Error::InvalidKey("halves are equal"));
        }

        Ok(())
    }

    /// Encrypt whole blocks in place (ECB)
    pub fn encrypt_ecb(&self, data: &mut [u8]) -> Result<()> {
        check_aligned(data)?;
        let cipher = self.cipher();
        for block in data.chunks_exact_mut(BLOCK_SIZE) {
            cipher.encrypt_block(GenericArray::from_mut_slice(block));
        }
        Ok(())
    }

    /// Decrypt whole blocks in place (ECB)
    pub fn decrypt_ecb(&self, data: &mut [u8]) -> Result<()> {
        check_aligned(data)?;
        let cipher = self.cipher();
        for block in data.chunks_exact_mut(BLOCK_SIZE) {
            cipher.decrypt_block(GenericArray::from_mut_slice(block));
        }
        Ok(())
    }

    /// Encrypt whole blocks in place (CBC)
    pub fn encrypt_cbc(&self, iv: &Iv, data: &mut [u8]) -> Result<()> {
        check_aligned(data)?;
        let mut encryptor = cbc::Encryptor::<TdesEde2>::new(
            GenericArray::from_slice(&self.0),
            GenericArray::from_slice(iv),
        );
        for block in data.chunks_exact_mut(BLOCK_SIZE) {
            encryptor.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        Ok(())
    }

    /// Decrypt whole blocks in place (CBC)
    pub fn decrypt_cbc(&self, iv: &Iv, data: &mut [u8]) -> Result<()> {
        check_aligned(data)?;
        let mut decryptor = cbc::Decryptor::<TdesEde2>::new(
            GenericArray::from_slice(&self.0),
            GenericArray::from_slice(iv),
        );
        for block in data.chunks_exact_mut(BLOCK_SIZE) {
            decryptor.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        Ok(())
    }

    /// Encrypt another key under this one (ECB)
    pub fn wrap(&self, key: &DesKey) -> Result<[u8; KEY_SIZE]> {
        let mut out = key.0;
        self.encrypt_ecb(&mut out)?;
        Ok(out)
    }

    /// Recover a key encrypted under this one (ECB)
    pub fn unwrap_key(&self, wrapped: &[u8]) -> Result<DesKey> {
        let mut key = DesKey::from_slice(wrapped)?;
        self.decrypt_ecb(&mut key.0)?;
        Ok(key)
    }

    fn cipher(&self) -> TdesEde2 {
        TdesEde2::new(GenericArray::from_slice(&self.0))
    }
}

impl fmt::Debug for DesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DesKey(..)")
    }
}

/// Set the low bit of every byte so each byte has odd parity
pub fn adjust_parity(key: &mut [u8]) {
    for byte in key.iter_mut() {
        let high = *byte & 0xFE;
        *byte = if high.count_ones() % 2 == 0 { high | 1 } else { high };
    }
}

/// Check that every byte has odd parity
pub fn has_odd_parity(key: &[u8]) -> bool {
    key.iter().all(|b| b.count_ones() % 2 == 1)
}

/// Check a single-DES key against the weak and semi-weak tables
pub fn is_weak(key: &[u8]) -> bool {
    let mut adjusted = [0u8; BLOCK_SIZE];
    if key.len() != BLOCK_SIZE {
        return false;
    }
    adjusted.copy_from_slice(key);
    adjust_parity(&mut adjusted);
    WEAK_KEYS.contains(&adjusted)
}

/// Fill a fixed-size buffer with random bytes
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    rand::rng().fill_bytes(&mut out);
    out
}

fn check_aligned(data: &[u8]) -> Result<()> {
    if data.len() % BLOCK_SIZE != 0 {
        return Err(Error::NotBlockAligned { len: data.len() });
    }
    Ok(())
}
