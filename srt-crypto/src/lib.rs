//! SRT Encryption
//!
//! Key material handling for SRT: the passphrase-derived key-encrypting
//! key, RFC 3394 key wrapping, the AES-CTR payload cipher, the key
//! material message carried in KMREQ/KMRSP and the per-connection crypto
//! context that drives key exchange and rekeying.
//!
//! `ring` supplies PBKDF2 and randomness; the AES block cipher comes from
//! the RustCrypto `aes` crate.

pub mod cipher;
pub mod context;
pub mod error;
pub mod kek;
pub mod km;
pub mod state;
pub mod wrap;

pub use context::{CryptoConfig, CryptoControl, KmReply};
pub use error::CryptoError;
pub use km::KmMessage;
pub use state::{KeyParity, KmState};

/// Salt length carried in key material messages
pub const SALT_LEN: usize = 16;

/// Shortest accepted passphrase
pub const MIN_PASSPHRASE_LEN: usize = 10;

/// Longest accepted passphrase
pub const MAX_PASSPHRASE_LEN: usize = 79;

/// Check a passphrase against the allowed length range
pub fn validate_passphrase(passphrase: &[u8]) -> Result<(), CryptoError> {
    if (MIN_PASSPHRASE_LEN..=MAX_PASSPHRASE_LEN).contains(&passphrase.len()) {
        Ok(())
    } else {
        Err(CryptoError::InvalidPassphraseLength(passphrase.len()))
    }
}

/// Check a key length (bytes) against the AES key sizes
pub fn validate_key_len(key_len: usize) -> Result<(), CryptoError> {
    match key_len {
        16 | 24 | 32 => Ok(()),
        other => Err(CryptoError::InvalidKeyLength(other)),
    }
}
