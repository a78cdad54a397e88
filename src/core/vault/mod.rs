use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{Result, anyhow};
use base64::Engine;
use hmac::Mac;
use sha2::Sha256;
use tracing::warn;

type HmacSha256 = hmac::Hmac<Sha256>;

const NONCE_LEN: usize = 12;

/// Encrypts credential secrets before they reach the database.
/// Stored form is base64(nonce || ciphertext).
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

/// Derive a 256-bit key from machine-specific identifiers:
/// HMAC-SHA256(hostname + username, "capflow-credentials-v1").
/// Stable across restarts, tied to the local machine and user.
fn derive_key() -> Result<[u8; 32]> {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown-host".to_string());
    let username = whoami::username();
    let input = format!("{}{}", hostname, username);

    let mut mac = <HmacSha256 as Mac>::new_from_slice(b"capflow-credentials-v1")
        .map_err(|e| anyhow!("HMAC key rejected: {}", e))?;
    mac.update(input.as_bytes());
    let bytes = mac.finalize().into_bytes();

    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

impl SecretCipher {
    pub fn new() -> Result<Self> {
        Self::with_key(&derive_key()?)
    }

    pub fn with_key(key: &[u8; 32]) -> Result<Self> {
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|e| anyhow!("invalid cipher key: {}", e))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| anyhow!("Encryption failed: {}", e))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(base64::engine::general_purpose::STANDARD.encode(&combined))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let combined = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| anyhow!("Base64 decode failed: {}", e))?;

        if combined.len() <= NONCE_LEN {
            return Err(anyhow!("Encrypted value too short"));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| anyhow!("Decryption failed: {}", e))?;

        String::from_utf8(plaintext).map_err(|e| anyhow!("UTF-8 decode failed: {}", e))
    }

    /// Decrypt a stored secret. Values written before encryption was enabled
    /// come back unchanged, and `needs_rewrite` tells the caller to re-store them.
    pub fn reveal(&self, stored: &str, credential_id: i64) -> Revealed {
        match self.decrypt(stored) {
            Ok(secret) => Revealed {
                secret,
                needs_rewrite: false,
            },
            Err(_) => {
                warn!(
                    credential_id,
                    "Credential secret appears to be a plaintext legacy value, re-encrypting"
                );
                Revealed {
                    secret: stored.to_string(),
                    needs_rewrite: true,
                }
            }
        }
    }
}

pub struct Revealed {
    pub secret: String,
    pub needs_rewrite: bool,
}
