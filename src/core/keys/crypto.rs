//! Sealing of key material and masking of sensitive fields.
//!
//! Material is sealed with AES-256-GCM under a key derived from the platform
//! secret and salt via PBKDF2-HMAC-SHA256. Tokens are base64 of
//! `nonce || ciphertext`. Masking is centralized here so audit writes and
//! outward-facing errors show secrets the same way.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

const PBKDF2_ITERATIONS: u32 = 100_000;
const NONCE_LEN: usize = 12;

/// Seals and opens secret strings.
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl SecretCipher {
    /// Derive the sealing key from the platform secret and salt.
    pub fn new(secret: &str, salt: &str) -> Result<Self> {
        if secret.is_empty() || salt.is_empty() {
            return Err(Error::Config(
                "encryption key and salt must be non-empty".into(),
            ));
        }
        let mut key_bytes = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(
            secret.as_bytes(),
            salt.as_bytes(),
            PBKDF2_ITERATIONS,
            &mut key_bytes,
        );
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Encrypt a plaintext secret into a transportable token.
    pub fn seal(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| Error::Store("sealing key material failed".into()))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(combined))
    }

    /// Decrypt a token produced by [`seal`](Self::seal).
    pub fn open(&self, token: &str) -> Result<String> {
        let combined = BASE64
            .decode(token)
            .map_err(|_| Error::Store("sealed material is not valid base64".into()))?;
        if combined.len() <= NONCE_LEN {
            return Err(Error::Store("sealed material too short".into()));
        }
        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| Error::Store("opening sealed material failed".into()))?;
        String::from_utf8(plaintext)
            .map_err(|_| Error::Store("sealed material is not valid utf-8".into()))
    }
}

/// Mask a secret for logs, audits and histories.
///
/// Keeps the first and last four characters, stars the middle. Secrets of
/// eight characters or fewer are fully starred.
#[must_use]
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}{}{tail}", "*".repeat(chars.len() - 8))
}

/// Hex SHA-256 digest used as the material lookup index.
#[must_use]
pub fn material_hash(material: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(material.as_bytes());
    hex::encode(hasher.finalize())
}

/// Generate fresh opaque key material: `tw_<hex>_<checksum>` where the
/// checksum is the first four hex chars of the payload's SHA-256.
#[must_use]
pub fn generate_material(hex_len: usize) -> String {
    let byte_len = hex_len.div_ceil(2).max(8);
    let mut bytes = vec![0u8; byte_len];
    rand::thread_rng().fill_bytes(&mut bytes);
    let payload: String = hex::encode(bytes).chars().take(hex_len.max(16)).collect();

    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    let checksum: String = hex::encode(hasher.finalize()).chars().take(4).collect();

    format!("tw_{payload}_{checksum}")
}
