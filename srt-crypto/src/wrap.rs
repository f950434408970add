//! AES key wrap (RFC 3394)
//!
//! Stream encrypting keys travel wrapped under the passphrase-derived KEK.
//! Unwrapping with the wrong KEK fails the integrity check, which is how a
//! mismatched passphrase is detected.

use crate::cipher::AesKey;
use crate::error::CryptoError;
use aes::Block;

/// Default initial value from RFC 3394 section 2.2.3.1
const DEFAULT_IV: [u8; 8] = [0xA6; 8];

/// Wrap `plain` (a multiple of 8 bytes, at least 16) under `kek`
///
/// The output is 8 bytes longer than the input.
pub fn wrap(kek: &AesKey, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if plain.len() < 16 || plain.len() % 8 != 0 {
        return Err(CryptoError::MalformedMessage("wrap input must be 8-byte blocks"));
    }

    let n = plain.len() / 8;
    let mut a = DEFAULT_IV;
    let mut r: Vec<[u8; 8]> = plain
        .chunks_exact(8)
        .map(|c| {
            let mut block = [0u8; 8];
            block.copy_from_slice(c);
            block
        })
        .collect();

    for j in 0..6 {
        for (i, ri) in r.iter_mut().enumerate() {
            let mut b = Block::default();
            b[..8].copy_from_slice(&a);
            b[8..].copy_from_slice(ri);
            kek.encrypt_block(&mut b);

            let t = (n * j + i + 1) as u64;
            a.copy_from_slice(&b[..8]);
            xor_counter(&mut a, t);
            ri.copy_from_slice(&b[8..]);
        }
    }

    let mut out = Vec::with_capacity(plain.len() + 8);
    out.extend_from_slice(&a);
    for ri in &r {
        out.extend_from_slice(ri);
    }
    Ok(out)
}

/// Reverse of [`wrap`]
pub fn unwrap(kek: &AesKey, wrapped: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if wrapped.len() < 24 || wrapped.len() % 8 != 0 {
        return Err(CryptoError::MalformedMessage("wrapped key has bad length"));
    }

    let n = wrapped.len() / 8 - 1;
    let mut a = [0u8; 8];
    a.copy_from_slice(&wrapped[..8]);
    let mut r: Vec<[u8; 8]> = wrapped[8..]
        .chunks_exact(8)
        .map(|c| {
            let mut block = [0u8; 8];
            block.copy_from_slice(c);
            block
        })
        .collect();

    for j in (0..6).rev() {
        for (i, ri) in r.iter_mut().enumerate().rev() {
            let t = (n * j + i + 1) as u64;
            xor_counter(&mut a, t);

            let mut b = Block::default();
            b[..8].copy_from_slice(&a);
            b[8..].copy_from_slice(ri);
            kek.decrypt_block(&mut b);

            a.copy_from_slice(&b[..8]);
            ri.copy_from_slice(&b[8..]);
        }
    }

    if a != DEFAULT_IV {
        return Err(CryptoError::IntegrityCheckFailed);
    }

    Ok(r.concat())
}

fn xor_counter(a: &mut [u8; 8], t: u64) {
    for (byte, tb) in a.iter_mut().zip(t.to_be_bytes()) {
        *byte ^= tb;
    }
}
