//! Sealed secrets at rest
//!
//! Server key shares, server keypair private keys and backup snapshots are
//! encrypted with AES-256-GCM under a key derived from the custody master key.
//! Every sealed value is bound to a context string (passed as associated data),
//! so a ciphertext copied to another row fails to open.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use frost_ed25519 as frost;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Key store errors
#[derive(Debug, Error)]
pub enum KeystoreError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("encryption error: {0}")]
    Encryption(String),
    #[error("decryption error: {0}")]
    Decryption(String),
    #[error("FROST error: {0}")]
    Frost(String),
    #[error("invalid master key: {0}")]
    InvalidMasterKey(String),
    #[error("wrong master key or tampered ciphertext")]
    InvalidKey,
}

/// Sealed value format
#[derive(Debug, Serialize, Deserialize)]
struct SealedValue {
    /// Version for future format changes
    version: u8,
    /// Salt for key derivation (hex-encoded)
    salt: String,
    /// Nonce for AES-GCM (hex-encoded)
    nonce: String,
    /// Ciphertext (hex-encoded)
    ciphertext: String,
}

/// Ed25519 share material before sealing
#[derive(Debug, Serialize, Deserialize)]
pub struct Ed25519ShareData {
    /// Serialized FROST key package (hex)
    pub key_package: String,
    /// Serialized FROST public key package (hex)
    pub public_key_package: String,
}

impl Ed25519ShareData {
    pub fn from_packages(
        key_package: &frost::keys::KeyPackage,
        public_key_package: &frost::keys::PublicKeyPackage,
    ) -> Result<Self, KeystoreError> {
        let key_bytes = key_package
            .serialize()
            .map_err(|e| KeystoreError::Frost(e.to_string()))?;
        let pubkey_bytes = public_key_package
            .serialize()
            .map_err(|e| KeystoreError::Frost(e.to_string()))?;

        Ok(Self {
            key_package: hex::encode(key_bytes),
            public_key_package: hex::encode(pubkey_bytes),
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, KeystoreError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeystoreError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn packages(
        &self,
    ) -> Result<(frost::keys::KeyPackage, frost::keys::PublicKeyPackage), KeystoreError> {
        let key_bytes = hex::decode(&self.key_package)
            .map_err(|e| KeystoreError::Frost(e.to_string()))?;
        let pubkey_bytes = hex::decode(&self.public_key_package)
            .map_err(|e| KeystoreError::Frost(e.to_string()))?;

        let key_package = frost::keys::KeyPackage::deserialize(&key_bytes)
            .map_err(|e| KeystoreError::Frost(e.to_string()))?;
        let public_key_package = frost::keys::PublicKeyPackage::deserialize(&pubkey_bytes)
            .map_err(|e| KeystoreError::Frost(e.to_string()))?;

        Ok((key_package, public_key_package))
    }

    /// Group verifying key (hex), the public key recorded next to the share
    pub fn group_public_key(&self) -> Result<String, KeystoreError> {
        let (_, pubkeys) = self.packages()?;
        let bytes = pubkeys
            .verifying_key()
            .serialize()
            .map_err(|e| KeystoreError::Frost(e.to_string()))?;
        Ok(hex::encode(bytes))
    }
}

/// Custody master key
#[derive(Clone)]
pub struct MasterKey([u8; 32]);

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a 64-character hex key
    pub fn from_hex(value: &str) -> Result<Self, KeystoreError> {
        let bytes = hex::decode(value.trim())
            .map_err(|e| KeystoreError::InvalidMasterKey(e.to_string()))?;
        let key: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            KeystoreError::InvalidMasterKey(format!("expected 32 bytes, got {}", v.len()))
        })?;
        Ok(Self(key))
    }

    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    /// Derive the per-value encryption key using SHA-256
    fn derive_key(&self, salt: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.0);
        hasher.update(salt);
        hasher.update(b"tss-custody-v1");
        hasher.finalize().into()
    }

    /// Encrypt `plaintext` bound to `context`
    pub fn seal(&self, context: &str, plaintext: &[u8]) -> Result<String, KeystoreError> {
        let mut salt = [0u8; 16];
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let key = self.derive_key(&salt);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| KeystoreError::Encryption(e.to_string()))?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: context.as_bytes(),
                },
            )
            .map_err(|e| KeystoreError::Encryption(e.to_string()))?;

        let sealed = SealedValue {
            version: 1,
            salt: hex::encode(salt),
            nonce: hex::encode(nonce_bytes),
            ciphertext: hex::encode(ciphertext),
        };

        Ok(serde_json::to_string(&sealed)?)
    }

    /// Decrypt a value produced by [`MasterKey::seal`] with the same context
    pub fn open(&self, context: &str, sealed: &str) -> Result<Vec<u8>, KeystoreError> {
        let sealed: SealedValue = serde_json::from_str(sealed)?;
        if sealed.version != 1 {
            return Err(KeystoreError::Decryption(format!(
                "unsupported sealed format version {}",
                sealed.version
            )));
        }

        let salt =
            hex::decode(&sealed.salt).map_err(|e| KeystoreError::Decryption(e.to_string()))?;
        let nonce_bytes =
            hex::decode(&sealed.nonce).map_err(|e| KeystoreError::Decryption(e.to_string()))?;
        let ciphertext = hex::decode(&sealed.ciphertext)
            .map_err(|e| KeystoreError::Decryption(e.to_string()))?;
        if nonce_bytes.len() != 12 {
            return Err(KeystoreError::Decryption("nonce must be 12 bytes".into()));
        }

        let key = self.derive_key(&salt);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| KeystoreError::Decryption(e.to_string()))?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        cipher
            .decrypt(
                nonce,
                Payload {
                    msg: ciphertext.as_ref(),
                    aad: context.as_bytes(),
                },
            )
            .map_err(|_| KeystoreError::InvalidKey)
    }
}
