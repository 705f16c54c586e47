//! At-rest encryption for MFA secrets and backup codes
//!
//! ChaCha20-Poly1305 with a random 12-byte nonce prepended to the
//! ciphertext. The AAD binds each ciphertext to the owning account and
//! its purpose, so a value copied onto another row fails to decrypt.
//! The key is provisioned outside this service (`MFA_ENCRYPTION_KEY`).

use anyhow::Result;
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use rand::RngCore;
use rand::rngs::OsRng;
use uuid::Uuid;

const NONCE_LEN: usize = 12;

/// Symmetric cipher for account-bound secrets
#[derive(Clone)]
pub struct SecretCipher {
    key: [u8; 32],
}

impl SecretCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Encrypt `plaintext` bound to `account_uuid` and `purpose`.
    /// Returns `nonce (12 bytes) || ciphertext`.
    pub fn encrypt(&self, account_uuid: Uuid, purpose: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let aad = construct_aad(account_uuid, purpose);
        let ciphertext = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|e| anyhow::anyhow!("Encryption failure: {e}"))?;

        let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);

        Ok(result)
    }

    /// Decrypt `nonce || ciphertext` produced by [`SecretCipher::encrypt`].
    pub fn decrypt(&self, account_uuid: Uuid, purpose: &str, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(anyhow::anyhow!("Invalid ciphertext length"));
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));

        let aad = construct_aad(account_uuid, purpose);
        let plaintext = cipher
            .decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|e| anyhow::anyhow!("Decryption failure: {e}"))?;

        Ok(plaintext)
    }
}

fn construct_aad(account_uuid: Uuid, purpose: &str) -> Vec<u8> {
    format!("plaza-auth:v1|{purpose}|{account_uuid}").into_bytes()
}
