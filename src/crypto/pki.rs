//! Direct-message encryption: X25519 key agreement and AES-256-CCM.
//!
//! Wire layout of an encrypted payload is `ciphertext || tag(8) || extra_nonce(4)`.

use ccm::aead::generic_array::GenericArray;
use ccm::aead::{AeadInPlace, KeyInit};
use ccm::aead::consts::{U13, U8};
use ccm::Ccm;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::error::CryptoError;

type Aes256Ccm = Ccm<aes::Aes256, U8, U13>;

const TAG_LEN: usize = 8;
const EXTRA_NONCE_LEN: usize = 4;

/// Bytes added to a payload by PKI encryption
pub const PKI_OVERHEAD: usize = TAG_LEN + EXTRA_NONCE_LEN;

fn to_key32(bytes: &[u8]) -> Result<[u8; 32], CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength(bytes.len()))
}

/// SHA-256 of the X25519 shared secret
fn shared_key(private_key: &[u8], public_key: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut secret_bytes = to_key32(private_key)?;
    let secret = StaticSecret::from(secret_bytes);
    secret_bytes.zeroize();
    let public = PublicKey::from(to_key32(public_key)?);
    let shared = secret.diffie_hellman(&public);
    Ok(Sha256::digest(shared.as_bytes()).into())
}

fn build_nonce(packet_id: u32, from: u32, extra_nonce: u32) -> [u8; 13] {
    let mut nonce = [0u8; 13];
    nonce[0..4].copy_from_slice(&packet_id.to_le_bytes());
    nonce[4..8].copy_from_slice(&extra_nonce.to_le_bytes());
    nonce[8..12].copy_from_slice(&from.to_le_bytes());
    nonce
}

/// Derive the X25519 public key for a private key
pub fn public_key_from_private(private_key: &[u8]) -> Result<[u8; 32], CryptoError> {
    let secret = StaticSecret::from(to_key32(private_key)?);
    Ok(PublicKey::from(&secret).to_bytes())
}

/// Generate a fresh X25519 private key
pub fn generate_private_key() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    StaticSecret::from(bytes).to_bytes()
}

/// Encrypt a payload from `from` (holding `private_key`) to the owner of `public_key`
pub fn pki_encrypt(
    plaintext: &[u8],
    private_key: &[u8],
    public_key: &[u8],
    packet_id: u32,
    from: u32,
) -> Result<Vec<u8>, CryptoError> {
    let mut key = shared_key(private_key, public_key)?;
    let cipher = Aes256Ccm::new_from_slice(&key).map_err(|_| CryptoError::InvalidKeyLength(32));
    key.zeroize();
    let cipher = cipher?;

    let extra_nonce = rand::thread_rng().next_u32();
    let nonce = build_nonce(packet_id, from, extra_nonce);

    let mut buf = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(&nonce), &[], &mut buf)
        .map_err(|_| CryptoError::AuthenticationFailed)?;
    buf.extend_from_slice(&tag);
    buf.extend_from_slice(&extra_nonce.to_le_bytes());
    Ok(buf)
}

/// Decrypt a payload addressed to the owner of `private_key`, sent by the owner of `public_key`
pub fn pki_decrypt(
    ciphertext: &[u8],
    private_key: &[u8],
    public_key: &[u8],
    packet_id: u32,
    from: u32,
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < PKI_OVERHEAD {
        return Err(CryptoError::CiphertextTooShort(ciphertext.len()));
    }
    let body_len = ciphertext.len() - PKI_OVERHEAD;
    let (body, trailer) = ciphertext.split_at(body_len);
    let (tag, extra) = trailer.split_at(TAG_LEN);
    let mut extra_bytes = [0u8; EXTRA_NONCE_LEN];
    extra_bytes.copy_from_slice(extra);
    let nonce = build_nonce(packet_id, from, u32::from_le_bytes(extra_bytes));

    let mut key = shared_key(private_key, public_key)?;
    let cipher = Aes256Ccm::new_from_slice(&key).map_err(|_| CryptoError::InvalidKeyLength(32));
    key.zeroize();
    let cipher = cipher?;

    let mut buf = body.to_vec();
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(&nonce),
            &[],
            &mut buf,
            GenericArray::from_slice(tag),
        )
        .map_err(|_| CryptoError::AuthenticationFailed)?;
    Ok(buf)
}
