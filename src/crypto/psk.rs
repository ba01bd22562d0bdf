//! Channel encryption (AES-CTR keyed by the channel PSK).

use aes::{Aes128, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;

use crate::error::CryptoError;

type Aes128Ctr = Ctr128BE<Aes128>;
type Aes256Ctr = Ctr128BE<Aes256>;

/// Per-packet IV: `packet_id` as u64 LE, `from` as u32 LE, 4 zero bytes
fn build_iv(packet_id: u32, from: u32) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[0..8].copy_from_slice(&(packet_id as u64).to_le_bytes());
    iv[8..12].copy_from_slice(&from.to_le_bytes());
    iv
}

/// Encrypt or decrypt a payload with a channel key.
///
/// CTR mode is an involution, so the same call both encrypts and decrypts.
/// An empty key means the channel is unencrypted and the data passes through.
pub fn psk_xor(data: &[u8], key: &[u8], packet_id: u32, from: u32) -> Result<Vec<u8>, CryptoError> {
    let mut buf = data.to_vec();
    if key.is_empty() {
        return Ok(buf);
    }
    let iv = build_iv(packet_id, from);
    match key.len() {
        16 => Aes128Ctr::new_from_slices(key, &iv)
            .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?
            .apply_keystream(&mut buf),
        32 => Aes256Ctr::new_from_slices(key, &iv)
            .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?
            .apply_keystream(&mut buf),
        n => return Err(CryptoError::InvalidKeyLength(n)),
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::protocol::DEFAULT_KEY;

    #[test]
    fn test_roundtrip_aes128() {
        let plain = b"the quick brown fox".to_vec();
        let enc = psk_xor(&plain, &DEFAULT_KEY, 0xDEAD_BEEF, 0x1234_5678).unwrap();
        assert_ne!(enc, plain);
        let dec = psk_xor(&enc, &DEFAULT_KEY, 0xDEAD_BEEF, 0x1234_5678).unwrap();
        assert_eq!(dec, plain);
    }

    #[test]
    fn test_roundtrip_aes256() {
        let key = [0x42u8; 32];
        let plain = vec![0u8; 64];
        let enc = psk_xor(&plain, &key, 1, 2).unwrap();
        assert_eq!(psk_xor(&enc, &key, 1, 2).unwrap(), plain);
    }

    #[test]
    fn test_keystream_depends_on_packet_and_sender() {
        let plain = vec![0u8; 16];
        let a = psk_xor(&plain, &DEFAULT_KEY, 1, 1).unwrap();
        let b = psk_xor(&plain, &DEFAULT_KEY, 2, 1).unwrap();
        let c = psk_xor(&plain, &DEFAULT_KEY, 1, 2).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_empty_key_passthrough() {
        assert_eq!(psk_xor(b"clear", &[], 1, 1).unwrap(), b"clear".to_vec());
    }

    #[test]
    fn test_bad_key_length() {
        assert_eq!(
            psk_xor(b"x", &[1, 2, 3], 1, 1),
            Err(CryptoError::InvalidKeyLength(3))
        );
    }

    #[test]
    fn test_iv_layout() {
        let iv = build_iv(0x0102_0304, 0x0A0B_0C0D);
        assert_eq!(
            iv,
            [4, 3, 2, 1, 0, 0, 0, 0, 0x0D, 0x0C, 0x0B, 0x0A, 0, 0, 0, 0]
        );
    }
}
