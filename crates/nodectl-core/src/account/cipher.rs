//! Shadowsocks cipher classification and 2022-edition key derivation

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::fmt;

/// Shortest secret accepted for any 2022-edition cipher
pub const MIN_SECRET_LEN: usize = 16;

/// Shadowsocks ciphers the controller knows how to provision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cipher {
    Aes128Gcm,
    Aes256Gcm,
    Chacha20Poly1305,
    XChacha20Poly1305,
    /// Plain relay without encryption
    None,
    /// `2022-blake3-aes-128-gcm`, the only 16-byte-key ("fast") variant
    Blake3Aes128Gcm,
    Blake3Aes256Gcm,
    Blake3Chacha20Poly1305,
}

impl Cipher {
    /// Parse a cipher name, case-insensitively, accepting common aliases
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "aes-128-gcm" | "aead_aes_128_gcm" => Some(Cipher::Aes128Gcm),
            "aes-256-gcm" | "aead_aes_256_gcm" => Some(Cipher::Aes256Gcm),
            "chacha20-poly1305" | "aead_chacha20_poly1305" | "chacha20-ietf-poly1305" => {
                Some(Cipher::Chacha20Poly1305)
            }
            "xchacha20-poly1305" | "xchacha20-ietf-poly1305" => Some(Cipher::XChacha20Poly1305),
            "none" | "plain" => Some(Cipher::None),
            "2022-blake3-aes-128-gcm" => Some(Cipher::Blake3Aes128Gcm),
            "2022-blake3-aes-256-gcm" => Some(Cipher::Blake3Aes256Gcm),
            "2022-blake3-chacha20-poly1305" => Some(Cipher::Blake3Chacha20Poly1305),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Cipher::Aes128Gcm => "aes-128-gcm",
            Cipher::Aes256Gcm => "aes-256-gcm",
            Cipher::Chacha20Poly1305 => "chacha20-poly1305",
            Cipher::XChacha20Poly1305 => "xchacha20-poly1305",
            Cipher::None => "none",
            Cipher::Blake3Aes128Gcm => "2022-blake3-aes-128-gcm",
            Cipher::Blake3Aes256Gcm => "2022-blake3-aes-256-gcm",
            Cipher::Blake3Chacha20Poly1305 => "2022-blake3-chacha20-poly1305",
        }
    }

    /// 2022-edition ciphers take a derived key instead of a password
    pub fn is_2022(&self) -> bool {
        matches!(
            self,
            Cipher::Blake3Aes128Gcm | Cipher::Blake3Aes256Gcm | Cipher::Blake3Chacha20Poly1305
        )
    }

    /// Legacy AEAD ciphers
    pub fn is_aead(&self) -> bool {
        matches!(
            self,
            Cipher::Aes128Gcm
                | Cipher::Aes256Gcm
                | Cipher::Chacha20Poly1305
                | Cipher::XChacha20Poly1305
        )
    }

    /// Raw key length of a 2022-edition cipher
    pub fn key_len(&self) -> Option<usize> {
        match self {
            Cipher::Blake3Aes128Gcm => Some(16),
            Cipher::Blake3Aes256Gcm | Cipher::Blake3Chacha20Poly1305 => Some(32),
            _ => None,
        }
    }
}

impl fmt::Display for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derive the base64 user key for a 2022-edition cipher from a secret
///
/// The secret is truncated to the cipher's key length. Secrets shorter
/// than [`MIN_SECRET_LEN`] bytes, or shorter than the key length, are
/// rejected.
pub fn derive_key(secret: &str, cipher: Cipher) -> Result<String, crate::Error> {
    let key_len = cipher.key_len().ok_or_else(|| {
        crate::Error::invalid_input(format!("{} does not use derived keys", cipher))
    })?;

    let bytes = secret.as_bytes();
    if bytes.len() < MIN_SECRET_LEN {
        return Err(crate::Error::invalid_input(format!(
            "{} key's length must be at least {} bytes, got {}",
            cipher,
            MIN_SECRET_LEN,
            bytes.len()
        )));
    }
    if bytes.len() < key_len {
        return Err(crate::Error::invalid_input(format!(
            "{} key's length must be at least {} bytes, got {}",
            cipher,
            key_len,
            bytes.len()
        )));
    }

    Ok(STANDARD.encode(&bytes[..key_len]))
}
