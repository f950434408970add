//! AES block cipher and the AES-CTR payload transform
//!
//! SRT encrypts each data payload with AES in counter mode. The 128-bit
//! counter block is the session salt with the packet sequence number mixed
//! in, followed by a 16-bit block counter:
//!
//! ```text
//!  0                       10          14      16
//! +------------------------+-----------+-------+
//! |      salt[0..10]       | salt ^ seq|  ctr  |
//! +------------------------+-----------+-------+
//! ```

use crate::error::CryptoError;
use crate::SALT_LEN;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256, Block};
use std::fmt;

pub const BLOCK_LEN: usize = 16;

/// AES with any of the three key sizes
#[derive(Clone)]
pub enum AesKey {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

impl AesKey {
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        let invalid = |_| CryptoError::InvalidKeyLength(key.len());
        Ok(match key.len() {
            16 => AesKey::Aes128(Aes128::new_from_slice(key).map_err(invalid)?),
            24 => AesKey::Aes192(Aes192::new_from_slice(key).map_err(invalid)?),
            32 => AesKey::Aes256(Aes256::new_from_slice(key).map_err(invalid)?),
            other => return Err(CryptoError::InvalidKeyLength(other)),
        })
    }

    pub fn encrypt_block(&self, block: &mut Block) {
        match self {
            AesKey::Aes128(c) => c.encrypt_block(block),
            AesKey::Aes192(c) => c.encrypt_block(block),
            AesKey::Aes256(c) => c.encrypt_block(block),
        }
    }

    pub fn decrypt_block(&self, block: &mut Block) {
        match self {
            AesKey::Aes128(c) => c.decrypt_block(block),
            AesKey::Aes192(c) => c.decrypt_block(block),
            AesKey::Aes256(c) => c.decrypt_block(block),
        }
    }
}

impl fmt::Debug for AesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits = match self {
            AesKey::Aes128(_) => 128,
            AesKey::Aes192(_) => 192,
            AesKey::Aes256(_) => 256,
        };
        write!(f, "AesKey({bits})")
    }
}

/// Counter block for packet `seq`, block counter zero
fn counter_block(salt: &[u8; SALT_LEN], seq: u32) -> [u8; BLOCK_LEN] {
    let mut iv = [0u8; BLOCK_LEN];
    iv[..14].copy_from_slice(&salt[..14]);
    for (byte, s) in iv[10..14].iter_mut().zip(seq.to_be_bytes()) {
        *byte ^= s;
    }
    iv
}

/// Encrypt or decrypt `payload` in place
///
/// Counter mode is its own inverse, so the same call serves both ways.
pub fn ctr_apply(key: &AesKey, salt: &[u8; SALT_LEN], seq: u32, payload: &mut [u8]) {
    let iv = counter_block(salt, seq);

    for (counter, chunk) in payload.chunks_mut(BLOCK_LEN).enumerate() {
        let mut block = Block::clone_from_slice(&iv);
        block[14..16].copy_from_slice(&(counter as u16).to_be_bytes());
        key.encrypt_block(&mut block);

        for (byte, keystream) in chunk.iter_mut().zip(block.iter()) {
            *byte ^= keystream;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_sizes() {
        assert!(AesKey::new(&[0u8; 16]).is_ok());
        assert!(AesKey::new(&[0u8; 24]).is_ok());
        assert!(AesKey::new(&[0u8; 32]).is_ok());
        assert_eq!(
            AesKey::new(&[0u8; 15]).unwrap_err(),
            CryptoError::InvalidKeyLength(15)
        );
    }

    #[test]
    fn test_fips197_aes128_block() {
        // FIPS-197 appendix C.1
        let key: Vec<u8> = (0u8..16).collect();
        let aes = AesKey::new(&key).unwrap();
        let mut block = Block::clone_from_slice(&[
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd,
            0xee, 0xff,
        ]);
        aes.encrypt_block(&mut block);
        assert_eq!(
            block.as_slice(),
            &[
                0x69, 0xc4, 0xe0, 0xd8, 0x6a, 0x7b, 0x04, 0x30, 0xd8, 0xcd, 0xb7, 0x80, 0x70, 0xb4,
                0xc5, 0x5a
            ]
        );
        aes.decrypt_block(&mut block);
        assert_eq!(block[0], 0x00);
        assert_eq!(block[15], 0xff);
    }

    #[test]
    fn test_ctr_restores_plaintext() {
        let key = AesKey::new(&[0x42; 16]).unwrap();
        let salt = [0x5a; SALT_LEN];
        let original: Vec<u8> = (0..1316).map(|i| i as u8).collect();

        let mut data = original.clone();
        ctr_apply(&key, &salt, 12345, &mut data);
        assert_ne!(data, original);

        ctr_apply(&key, &salt, 12345, &mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn test_ctr_depends_on_sequence() {
        let key = AesKey::new(&[0x42; 24]).unwrap();
        let salt = [0x00; SALT_LEN];

        let mut a = vec![0u8; 32];
        let mut b = vec![0u8; 32];
        ctr_apply(&key, &salt, 1, &mut a);
        ctr_apply(&key, &salt, 2, &mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn test_counter_block_layout() {
        let salt = [0u8; SALT_LEN];
        let iv = counter_block(&salt, 0x0102_0304);
        assert_eq!(&iv[10..14], &[1, 2, 3, 4]);
        assert_eq!(&iv[14..], &[0, 0]);
    }
}
