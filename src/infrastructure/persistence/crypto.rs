//! Record encryption
//!
//! All at-rest bytes pass through AES-128-GCM keyed by the caller-supplied
//! 16-byte key. The GCM tag doubles as the integrity check the store relies on
//! to reject a wrong key instead of returning garbled plaintext. The same
//! cipher seals provisioning blobs on the HTTP ingestion path.

use crate::domain::shared::{EngineError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;

const NONCE_LEN: usize = 12;

/// AES-128-GCM sealer/opener for persisted records and provisioning blobs.
#[derive(Clone)]
pub struct RecordCipher {
    cipher: Aes128Gcm,
}

impl std::fmt::Debug for RecordCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose key material through Debug output
        f.write_str("RecordCipher")
    }
}

impl RecordCipher {
    pub fn new(key: &[u8; 16]) -> Self {
        Self {
            cipher: Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key)),
        }
    }

    /// Seal plaintext; output layout is nonce || ciphertext+tag.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| EngineError::Internal("record encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Open a sealed record; a bad tag (wrong key or tampering) is a
    /// decryption error, never silently accepted.
    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(EngineError::Decryption(
                "sealed record is too short".to_string(),
            ));
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| EngineError::Decryption("integrity check failed".to_string()))
    }

    /// Seal and base64-wrap, for transport over the HTTP channel.
    pub fn seal_base64(&self, plaintext: &[u8]) -> Result<String> {
        Ok(BASE64.encode(self.seal(plaintext)?))
    }

    /// Decode base64 and open.
    pub fn open_base64(&self, data: &str) -> Result<Vec<u8>> {
        let raw = BASE64
            .decode(data.trim())
            .map_err(|e| EngineError::Decryption(format!("bad base64 payload: {}", e)))?;
        self.open(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_round_trip() {
        let cipher = RecordCipher::new(&[7u8; 16]);
        let sealed = cipher.seal(b"account record").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"account record");
        assert_eq!(cipher.open(&sealed).unwrap(), b"account record");
    }

    #[test]
    fn test_wrong_key_is_rejected() {
        let cipher = RecordCipher::new(&[7u8; 16]);
        let other = RecordCipher::new(&[8u8; 16]);
        let sealed = cipher.seal(b"account record").unwrap();
        let err = other.open(&sealed).unwrap_err();
        assert!(matches!(err, EngineError::Decryption(_)));
    }

    #[test]
    fn test_tampered_record_is_rejected() {
        let cipher = RecordCipher::new(&[7u8; 16]);
        let mut sealed = cipher.seal(b"account record").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(matches!(
            cipher.open(&sealed),
            Err(EngineError::Decryption(_))
        ));
    }

    #[test]
    fn test_base64_round_trip() {
        let cipher = RecordCipher::new(&[1u8; 16]);
        let blob = cipher.seal_base64(b"username=alice&domain=d").unwrap();
        assert_eq!(
            cipher.open_base64(&blob).unwrap(),
            b"username=alice&domain=d"
        );
    }

    #[test]
    fn test_truncated_record_is_rejected() {
        let cipher = RecordCipher::new(&[1u8; 16]);
        assert!(matches!(
            cipher.open(&[0u8; 4]),
            Err(EngineError::Decryption(_))
        ));
    }
}
