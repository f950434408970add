//! Key-encrypting key derivation

use crate::error::CryptoError;
use crate::{validate_key_len, validate_passphrase, SALT_LEN};
use ring::pbkdf2;
use std::num::NonZeroU32;

/// PBKDF2 iteration count used by SRT
pub const PBKDF2_ITERATIONS: u32 = 2048;

const ITERATIONS: NonZeroU32 = match NonZeroU32::new(PBKDF2_ITERATIONS) {
    Some(n) => n,
    None => panic!("PBKDF2 iteration count must be non-zero"),
};

/// Derive the KEK from a passphrase
///
/// Only the last 8 bytes of the salt feed PBKDF2.
pub fn derive_kek(
    passphrase: &[u8],
    salt: &[u8; SALT_LEN],
    key_len: usize,
) -> Result<Vec<u8>, CryptoError> {
    validate_passphrase(passphrase)?;
    validate_key_len(key_len)?;

    let mut kek = vec![0u8; key_len];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA1,
        ITERATIONS,
        &salt[SALT_LEN - 8..],
        passphrase,
        &mut kek,
    );
    Ok(kek)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_is_deterministic() {
        let salt = [7u8; SALT_LEN];
        let a = derive_kek(b"passphrase123", &salt, 16).unwrap();
        let b = derive_kek(b"passphrase123", &salt, 16).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_derive_matches_reference_vector() {
        // PBKDF2-HMAC-SHA1, 2048 rounds, over the salt's last 8 bytes
        let salt = [7u8; SALT_LEN];
        let kek = derive_kek(b"passphrase123", &salt, 16).unwrap();
        let hex: String = kek.iter().map(|b| format!("{:02x}", b)).collect();
        assert_eq!(hex, "509860be1aec3d2ce1365865b5a4f440");
        assert_eq!(ITERATIONS.get(), PBKDF2_ITERATIONS);
    }

    #[test]
    fn test_derive_depends_on_salt_tail() {
        let mut salt = [7u8; SALT_LEN];
        let a = derive_kek(b"passphrase123", &salt, 32).unwrap();

        // Head bytes do not take part in derivation
        salt[0] = 0;
        assert_eq!(a, derive_kek(b"passphrase123", &salt, 32).unwrap());

        salt[15] = 0;
        assert_ne!(a, derive_kek(b"passphrase123", &salt, 32).unwrap());
    }

    #[test]
    fn test_derive_rejects_bad_input() {
        let salt = [0u8; SALT_LEN];
        assert_eq!(
            derive_kek(b"short", &salt, 16),
            Err(CryptoError::InvalidPassphraseLength(5))
        );
        assert_eq!(
            derive_kek(b"long enough pass", &salt, 20),
            Err(CryptoError::InvalidKeyLength(20))
        );
    }
}
