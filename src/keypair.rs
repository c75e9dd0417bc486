//! Server keypair rotation
//!
//! The server authenticates protocol outputs to key-share nodes with a
//! secp256k1 ECDSA keypair. Rotation creates version N+1 and deactivates N in
//! one store transaction; old versions stay queryable so signatures made
//! under them can still be checked.

use k256::ecdsa::{
    signature::{Signer, Verifier},
    Signature, SigningKey, VerifyingKey,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::keystore::MasterKey;
use crate::logging::log_custody_event;
use crate::storage::CustodyStore;
use crate::types::ServerKeypair;

/// A payload signature tagged with the keypair version that made it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedSignature {
    pub version: u32,
    /// 64-byte compact ECDSA signature (hex)
    pub signature: String,
}

fn keypair_context(keypair: &ServerKeypair) -> String {
    format!("server-keypair:{}", keypair.id)
}

pub struct KeypairManager {
    store: Arc<dyn CustodyStore>,
    master_key: MasterKey,
}

impl KeypairManager {
    pub fn new(store: Arc<dyn CustodyStore>, master_key: MasterKey) -> Self {
        Self { store, master_key }
    }

    /// Generate a new keypair and make it the only active one
    pub async fn rotate(&self) -> Result<ServerKeypair> {
        let signing_key = SigningKey::random(&mut OsRng);
        let public_key = hex::encode(
            signing_key
                .verifying_key()
                .to_encoded_point(true)
                .as_bytes(),
        );

        let mut keypair = ServerKeypair::new(public_key, String::new());
        keypair.encrypted_private_key = self
            .master_key
            .seal(&keypair_context(&keypair), &signing_key.to_bytes())?;

        let previous = self.store.active_keypair().await?.map(|k| k.version);
        let stored = self.store.rotate_keypair(&keypair).await?;

        log_custody_event(
            "keypair_rotated",
            &stored.id.to_string(),
            true,
            serde_json::json!({ "version": stored.version, "previous_version": previous }),
            None,
        );
        Ok(stored)
    }

    pub async fn get_active(&self) -> Result<Option<ServerKeypair>> {
        Ok(self.store.active_keypair().await?)
    }

    /// Active keypair, or `KeypairNotProvisioned` if none was ever created
    pub async fn require_active(&self) -> Result<ServerKeypair> {
        self.get_active().await?.ok_or(Error::KeypairNotProvisioned)
    }

    pub async fn get_version(&self, version: u32) -> Result<ServerKeypair> {
        self.store
            .keypair_by_version(version)
            .await?
            .ok_or_else(|| Error::NotFound(format!("server keypair version {}", version)))
    }

    pub async fn list(&self) -> Result<Vec<ServerKeypair>> {
        Ok(self.store.list_keypairs().await?)
    }

    /// Sign with the active keypair
    pub async fn sign(&self, payload: &[u8]) -> Result<VersionedSignature> {
        let keypair = self.require_active().await?;
        let secret = self
            .master_key
            .open(&keypair_context(&keypair), &keypair.encrypted_private_key)?;
        let signing_key = SigningKey::from_slice(&secret)
            .map_err(|e| Error::internal(format!("stored keypair {} is corrupt: {}", keypair.version, e)))?;

        let signature: Signature = signing_key.sign(payload);
        Ok(VersionedSignature {
            version: keypair.version,
            signature: hex::encode(signature.to_bytes()),
        })
    }

    /// Check a signature made under any version, active or not
    pub async fn verify(&self, signed: &VersionedSignature, payload: &[u8]) -> Result<bool> {
        let keypair = self.get_version(signed.version).await?;
        let public_key = hex::decode(&keypair.public_key)
            .map_err(|e| Error::internal(format!("stored public key: {}", e)))?;
        let verifying_key = VerifyingKey::from_sec1_bytes(&public_key)
            .map_err(|e| Error::internal(format!("stored public key: {}", e)))?;

        let signature_bytes = hex::decode(&signed.signature)
            .map_err(|e| Error::invalid(format!("signature is not hex: {}", e)))?;
        let signature = Signature::from_slice(&signature_bytes)
            .map_err(|e| Error::invalid(format!("malformed signature: {}", e)))?;

        Ok(verifying_key.verify(payload, &signature).is_ok())
    }
}
