//! Credential-at-rest encryption for broker/OPC-UA connection secrets
//! (§4.13). AES-256-GCM, key sourced from a sidecar file — no unencrypted
//! fallback (the green-field choice recorded in `DESIGN.md`).

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key};
use base64::Engine;

use crate::error::{Error, Result};

const NONCE_LEN: usize = 12;

/// A ready-to-use AES-256-GCM key loaded from the sidecar file named by
/// `credential_encryption_key_path`.
#[derive(Clone)]
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    /// Loads the key from disk. The file must contain exactly 32 raw bytes,
    /// base64-encoded, one line. Refuses to start otherwise — there is no
    /// unencrypted fallback.
    pub fn from_key_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Crypto(format!("cannot read key file {path}: {e}")))?;
        let key_bytes = base64::engine::general_purpose::STANDARD
            .decode(contents.trim())
            .map_err(|e| Error::Crypto(format!("key file {path} is not valid base64: {e}")))?;
        if key_bytes.len() != 32 {
            return Err(Error::Crypto(format!(
                "key file {path} must decode to 32 bytes, got {}",
                key_bytes.len()
            )));
        }
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Ok(CredentialCipher {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Encrypts `plaintext`, returning `base64(nonce || ciphertext)`.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| Error::Crypto(format!("encryption failed: {e}")))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(out))
    }

    /// Decrypts a value produced by [`encrypt`](Self::encrypt). Any failure
    /// (bad base64, truncated payload, authentication failure) is surfaced
    /// as `Error::Crypto` — callers must not fall back to treating the value
    /// as plaintext.
    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| Error::Crypto(format!("stored credential is not valid base64: {e}")))?;
        if raw.len() < NONCE_LEN {
            return Err(Error::Crypto("stored credential is truncated".to_string()));
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let nonce = aes_gcm::Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| Error::Crypto(format!("decryption failed: {e}")))?;
        String::from_utf8(plaintext)
            .map_err(|e| Error::Crypto(format!("decrypted credential is not valid UTF-8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn cipher_with_random_key() -> CredentialCipher {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        let encoded = base64::engine::general_purpose::STANDARD.encode(key);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(encoded.as_bytes()).unwrap();
        CredentialCipher::from_key_file(file.path().to_str().unwrap()).unwrap()
    }

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let cipher = cipher_with_random_key();
        let secret = "s3kr1t-broker-password";
        let encrypted = cipher.encrypt(secret).unwrap();
        assert_ne!(encrypted, secret);
        let decrypted = cipher.decrypt(&encrypted).unwrap();
        assert_eq!(decrypted, secret);
    }

    #[test]
    fn decrypt_rejects_tampered_payload() {
        let cipher = cipher_with_random_key();
        let mut encrypted = cipher.encrypt("hello").unwrap();
        encrypted.push('x');
        assert!(cipher.decrypt(&encrypted).is_err());
    }

    #[test]
    fn rejects_key_file_with_wrong_length() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(base64::engine::general_purpose::STANDARD.encode("too-short").as_bytes())
            .unwrap();
        assert!(CredentialCipher::from_key_file(file.path().to_str().unwrap()).is_err());
    }
}
