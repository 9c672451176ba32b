//! Encrypted bundle wrapper for exported configuration files.
//!
//! AES-256-GCM with a PBKDF2-SHA256 key derived from an operator
//! passphrase. On-disk format: `base64(salt || nonce || ciphertext)`,
//! so a bundle can live next to plain JSON exports on FAT-formatted
//! removable storage without escaping problems.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use pbkdf2::pbkdf2_hmac_array;
use rand_core::{OsRng, RngCore};
use sha2::Sha256;

use crate::error::{Error, Result};

/// File suffix marking an encrypted sibling of a plain `.json` export.
pub const ENC_SUFFIX: &str = ".enc";

const SALT_SIZE: usize = 16;
const NONCE_SIZE: usize = 12;
const PBKDF2_ITERATIONS: u32 = 100_000;
const KEY_SIZE: usize = 32;

fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; KEY_SIZE] {
    pbkdf2_hmac_array::<Sha256, KEY_SIZE>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS)
}

/// Encrypts `data` into a base64 bundle.
pub fn encrypt_bundle(data: &[u8], passphrase: &str) -> Result<String> {
    let mut salt = [0u8; SALT_SIZE];
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut nonce_bytes);

    let key = derive_key(passphrase, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| Error::Internal(format!("cipher init: {e}")))?;
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, data)
        .map_err(|e| Error::Internal(format!("bundle encrypt: {e:?}")))?;

    let mut raw = Vec::with_capacity(SALT_SIZE + NONCE_SIZE + ciphertext.len());
    raw.extend_from_slice(&salt);
    raw.extend_from_slice(&nonce_bytes);
    raw.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(raw))
}

/// Decrypts a bundle produced by [`encrypt_bundle`].
pub fn decrypt_bundle(bundle: &str, passphrase: &str) -> Result<Vec<u8>> {
    let raw = BASE64
        .decode(bundle.trim())
        .map_err(|e| Error::Parse(format!("bundle base64: {e}")))?;
    // Minimum: salt + nonce + GCM auth tag.
    if raw.len() < SALT_SIZE + NONCE_SIZE + 16 {
        return Err(Error::Parse("bundle too short".to_string()));
    }

    let salt = &raw[..SALT_SIZE];
    let nonce_bytes = &raw[SALT_SIZE..SALT_SIZE + NONCE_SIZE];
    let ciphertext = &raw[SALT_SIZE + NONCE_SIZE..];

    let key = derive_key(passphrase, salt);
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| Error::Internal(format!("cipher init: {e}")))?;
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| Error::Parse("bundle decrypt failed (wrong passphrase or corrupt)".to_string()))
}

/// Heuristic: does `content` look like a bundle rather than plain JSON?
pub fn is_bundle(content: &str) -> bool {
    match BASE64.decode(content.trim()) {
        Ok(raw) => raw.len() >= SALT_SIZE + NONCE_SIZE + 16,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let plaintext = br#"{"id":"alpha","enabled":false}"#;
        let bundle = encrypt_bundle(plaintext, "hunter2").expect("encrypt");
        let back = decrypt_bundle(&bundle, "hunter2").expect("decrypt");
        assert_eq!(back, plaintext.to_vec());
    }

    #[test]
    fn wrong_passphrase_is_a_parse_error() {
        let bundle = encrypt_bundle(b"secret", "right").expect("encrypt");
        let err = decrypt_bundle(&bundle, "wrong").expect_err("must fail");
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn salts_make_bundles_unique() {
        let a = encrypt_bundle(b"same", "pw").expect("encrypt");
        let b = encrypt_bundle(b"same", "pw").expect("encrypt");
        assert_ne!(a, b);
    }

    #[test]
    fn plain_json_is_not_a_bundle() {
        assert!(!is_bundle(r#"{"id":"alpha"}"#));
        let bundle = encrypt_bundle(b"x", "pw").expect("encrypt");
        assert!(is_bundle(&bundle));
    }
}
