//! Key material message
//!
//! Carried in the KMREQ/KMRSP handshake extensions and in the in-band
//! KMREQ/KMRSP control packets.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |0|Vers |   PT  |             Sign              |   resv    |KK |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                              KEKI                             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    Cipher     |      Auth     |      SE       |     Resv1     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |             Resv2             |     Slen/4    |     Klen/4    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Salt (Slen bytes)                         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |              Wrapped key(s) (8 + n * Klen bytes)              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use crate::error::CryptoError;
use crate::state::KeyParity;
use crate::{validate_key_len, SALT_LEN};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const VERSION_AND_TYPE: u8 = 0x12;
const SIGNATURE: u16 = 0x2029;
const CIPHER_AES_CTR: u8 = 2;
const AUTH_NONE: u8 = 0;
const SE_SRT: u8 = 2;
const HEADER_LEN: usize = 16;

/// Parsed key material message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KmMessage {
    /// Key flags: bit 0 = even key present, bit 1 = odd key present
    pub key_flags: u8,
    /// Key length in bytes
    pub key_len: usize,
    pub salt: [u8; SALT_LEN],
    /// RFC 3394 wrapped key(s), even before odd when both are present
    pub wrapped: Bytes,
}

impl KmMessage {
    pub fn has_key(&self, parity: KeyParity) -> bool {
        self.key_flags & parity.flag() != 0
    }

    pub fn key_count(&self) -> usize {
        (self.key_flags & 0b11).count_ones() as usize
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + SALT_LEN + self.wrapped.len());
        buf.put_u8(VERSION_AND_TYPE);
        buf.put_u16(SIGNATURE);
        buf.put_u8(self.key_flags & 0b11);
        buf.put_u32(0); // KEKI
        buf.put_u8(CIPHER_AES_CTR);
        buf.put_u8(AUTH_NONE);
        buf.put_u8(SE_SRT);
        buf.put_u8(0);
        buf.put_u16(0);
        buf.put_u8((SALT_LEN / 4) as u8);
        buf.put_u8((self.key_len / 4) as u8);
        buf.put_slice(&self.salt);
        buf.put_slice(&self.wrapped);
        buf.freeze()
    }

    pub fn decode(mut data: &[u8]) -> Result<Self, CryptoError> {
        if data.len() < HEADER_LEN {
            return Err(CryptoError::MalformedMessage("too short"));
        }

        if data.get_u8() != VERSION_AND_TYPE {
            return Err(CryptoError::MalformedMessage("bad version or type"));
        }
        if data.get_u16() != SIGNATURE {
            return Err(CryptoError::MalformedMessage("bad signature"));
        }
        let key_flags = data.get_u8() & 0b11;
        if key_flags == 0 {
            return Err(CryptoError::MalformedMessage("no key present"));
        }
        let _keki = data.get_u32();
        if data.get_u8() != CIPHER_AES_CTR {
            return Err(CryptoError::MalformedMessage("unsupported cipher"));
        }
        let _auth = data.get_u8();
        if data.get_u8() != SE_SRT {
            return Err(CryptoError::MalformedMessage("unsupported stream encapsulation"));
        }
        let _resv1 = data.get_u8();
        let _resv2 = data.get_u16();
        let salt_len = data.get_u8() as usize * 4;
        let key_len = data.get_u8() as usize * 4;

        if salt_len != SALT_LEN {
            return Err(CryptoError::MalformedMessage("unsupported salt length"));
        }
        validate_key_len(key_len)?;

        let key_count = key_flags.count_ones() as usize;
        let wrapped_len = 8 + key_len * key_count;
        if data.len() < SALT_LEN + wrapped_len {
            return Err(CryptoError::MalformedMessage("truncated key material"));
        }

        let mut salt = [0u8; SALT_LEN];
        data.copy_to_slice(&mut salt);
        let wrapped = Bytes::copy_from_slice(&data[..wrapped_len]);

        Ok(KmMessage {
            key_flags,
            key_len,
            salt,
            wrapped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(key_flags: u8) -> KmMessage {
        let count = (key_flags & 0b11).count_ones() as usize;
        KmMessage {
            key_flags,
            key_len: 16,
            salt: [0xAB; SALT_LEN],
            wrapped: Bytes::from(vec![0x11; 8 + 16 * count]),
        }
    }

    #[test]
    fn test_header_layout() {
        let encoded = sample(0b01).encode();
        assert_eq!(encoded[0], 0x12);
        assert_eq!(&encoded[1..3], &[0x20, 0x29]);
        assert_eq!(encoded[3], 0b01);
        assert_eq!(encoded[8], 2); // AES-CTR
        assert_eq!(encoded[10], 2); // SRT encapsulation
        assert_eq!(encoded[14], 4); // 16-byte salt
        assert_eq!(encoded[15], 4); // 16-byte key
        assert_eq!(encoded.len(), 16 + 16 + 24);
    }

    #[test]
    fn test_decode_both_keys() {
        let msg = sample(0b11);
        let decoded = KmMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
        assert!(decoded.has_key(KeyParity::Even));
        assert!(decoded.has_key(KeyParity::Odd));
        assert_eq!(decoded.key_count(), 2);
    }

    #[test]
    fn test_decode_rejects_bad_signature() {
        let mut raw = sample(0b10).encode().to_vec();
        raw[1] = 0;
        assert_eq!(
            KmMessage::decode(&raw),
            Err(CryptoError::MalformedMessage("bad signature"))
        );
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let raw = sample(0b11).encode();
        assert!(KmMessage::decode(&raw[..raw.len() - 1]).is_err());
        assert!(KmMessage::decode(&raw[..10]).is_err());
    }
}
