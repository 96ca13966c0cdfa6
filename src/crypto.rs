// AFDX-lite - TDMA gateway protocol core
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Symmetric primitives shared by the codec and the security manager
//!
//! - Sealing: ChaCha20-Poly1305 with a fresh 96-bit nonce per message,
//!   encoded as `<iv_hex>:<ciphertext_hex>`
//! - MAC: HMAC-SHA256, hex encoded, constant-time verification

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

/// Symmetric key length in bytes
pub const KEY_LEN: usize = 32;

/// AEAD nonce length in bytes
pub const NONCE_LEN: usize = 12;

/// Raw symmetric key
pub type KeyBytes = [u8; KEY_LEN];

type HmacSha256 = Hmac<Sha256>;

/// Errors from the symmetric primitives
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// Sealed string is not `<iv_hex>:<ciphertext_hex>`
    #[error("invalid sealed format")]
    Format,
    /// Authentication tag did not verify
    #[error("authentication tag mismatch")]
    Tag,
    /// Key has the wrong length
    #[error("invalid key length")]
    KeyLength,
}

/// Generate a random symmetric key
pub fn random_key() -> KeyBytes {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

/// Generate `len` random bytes, hex encoded
pub fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Parse a 64-character hex key
pub fn key_from_hex(key_hex: &str) -> Result<KeyBytes, CryptoError> {
    let bytes = hex::decode(key_hex).map_err(|_| CryptoError::KeyLength)?;
    bytes.try_into().map_err(|_| CryptoError::KeyLength)
}

/// Encrypt `plaintext`, binding `aad`
pub fn seal(key: &KeyBytes, plaintext: &[u8], aad: &[u8]) -> Result<String, CryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::KeyLength)?;
    let mut iv = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut iv);

    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Tag)?;

    Ok(format!("{}:{}", hex::encode(iv), hex::encode(ciphertext)))
}

/// Decrypt a string produced by [`seal`] with the same key and `aad`
pub fn open(key: &KeyBytes, sealed: &str, aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let (iv_hex, ciphertext_hex) = sealed.split_once(':').ok_or(CryptoError::Format)?;
    let iv = hex::decode(iv_hex).map_err(|_| CryptoError::Format)?;
    if iv.len() != NONCE_LEN {
        return Err(CryptoError::Format);
    }
    let ciphertext = hex::decode(ciphertext_hex).map_err(|_| CryptoError::Format)?;

    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::KeyLength)?;
    cipher
        .decrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: &ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Tag)
}

fn keyed_mac(key: &KeyBytes, parts: &[&[u8]]) -> Result<HmacSha256, CryptoError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| CryptoError::KeyLength)?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac)
}

/// HMAC-SHA256 over the concatenation of `parts`, hex encoded
pub fn compute_mac(key: &KeyBytes, parts: &[&[u8]]) -> Result<String, CryptoError> {
    let mac = keyed_mac(key, parts)?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify a hex MAC in constant time; unreadable tags do not verify
pub fn verify_mac(key: &KeyBytes, parts: &[&[u8]], tag_hex: &str) -> bool {
    let Ok(tag) = hex::decode(tag_hex) else {
        return false;
    };
    match keyed_mac(key, parts) {
        Ok(mac) => mac.verify_slice(&tag).is_ok(),
        Err(_) => false,
    }
}
