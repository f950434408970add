//! Crypto error types

use crate::state::{KeyParity, KmState};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Passphrase must be 10 to 79 bytes, got {0}")]
    InvalidPassphraseLength(usize),

    #[error("Invalid key length: {0} (expected 16, 24 or 32)")]
    InvalidKeyLength(usize),

    #[error("Key unwrap integrity check failed")]
    IntegrityCheckFailed,

    #[error("Malformed key material message: {0}")]
    MalformedMessage(&'static str),

    #[error("No {0:?} key installed")]
    NoKey(KeyParity),

    #[error("No passphrase configured")]
    NoSecret,

    #[error("Random number generation failed")]
    Random,

    #[error("Invalid key material state transition: {from:?} -> {to:?}")]
    InvalidStateTransition { from: KmState, to: KmState },
}
