//! Packet crypto: channel hashing, channel (PSK) and direct-message (PKI)
//! encryption, key parsing.

pub mod pki;
pub mod psk;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use prost::Message;

use crate::error::{CryptoError, IdError};
use crate::protobufs::{Data, MeshPacket, PortNum};

pub use pki::{generate_private_key, pki_decrypt, pki_encrypt, public_key_from_private, PKI_OVERHEAD};
pub use psk::psk_xor;

/// Decode a base64 key, tolerating the URL-safe alphabet and missing padding
pub fn parse_key(key: &str) -> Result<Vec<u8>, IdError> {
    let trimmed = key.trim();
    let padding = (4 - trimmed.len() % 4) % 4;
    let normalized: String = trimmed
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .chain(std::iter::repeat('=').take(padding))
        .collect();
    STANDARD
        .decode(normalized)
        .map_err(|e| IdError::InvalidKey(e.to_string()))
}

/// Firmware channel hash: XOR of every name byte with every key byte
pub fn channel_hash(name: &str, key: &[u8]) -> u8 {
    let xor = |bytes: &[u8]| bytes.iter().fold(0u8, |acc, b| acc ^ b);
    xor(name.as_bytes()) ^ xor(key)
}

/// Decode a `Data` record from plaintext, rejecting garbage produced by a wrong key
pub fn decode_data(plaintext: &[u8]) -> Result<Data, CryptoError> {
    let data = Data::decode(plaintext).map_err(|_| CryptoError::InvalidPayload)?;
    if data.port() == PortNum::UnknownApp {
        return Err(CryptoError::InvalidPayload);
    }
    Ok(data)
}

/// Get the decoded payload of a packet, decrypting it with a channel key if needed
pub fn try_decode(packet: &MeshPacket, key: &[u8]) -> Result<Data, CryptoError> {
    if let Some(data) = packet.decoded() {
        return Ok(data.clone());
    }
    let encrypted = packet.encrypted().ok_or(CryptoError::EmptyPacket)?;
    let plaintext = psk_xor(encrypted, key, packet.id, packet.from)?;
    decode_data(&plaintext)
}
