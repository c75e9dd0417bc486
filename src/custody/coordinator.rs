//! Key-share custody coordinator
//!
//! Owns the server's sealed key shares, the node registry, and the checks
//! that every assigned node still holds its share.

use futures_util::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::node_client::{NodeClient, NodeError};
use crate::error::{Error, Result};
use crate::keystore::{Ed25519ShareData, MasterKey};
use crate::logging::log_custody_event;
use crate::storage::{CustodyStore, StorageError};
use crate::types::{Curve, KeyShare, KeyShareNode, KeyShareStatus, NodeFailure};

/// Replacement material for one curve
#[derive(Debug, Clone)]
pub struct CurveReshare {
    /// Freshly re-split server share (plaintext; sealed before storage)
    pub server_share: Vec<u8>,
    /// Group public key; must match the current one
    pub public_key: String,
    /// Nodes holding the new client-side shares
    pub node_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Default)]
pub struct ReshareRequest {
    pub secp256k1: Option<CurveReshare>,
    pub ed25519: Option<CurveReshare>,
}

/// Per-curve outcome of a reshare; curves succeed or fail independently
#[derive(Debug, Default)]
pub struct ReshareReport {
    pub replaced: Vec<KeyShare>,
    pub failed: Vec<(Curve, Error)>,
}

impl ReshareReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

fn share_context(wallet_id: &str, curve: Curve) -> String {
    format!("keyshare:{}:{}", wallet_id, curve)
}

pub struct CustodyCoordinator {
    store: Arc<dyn CustodyStore>,
    client: Arc<dyn NodeClient>,
    master_key: MasterKey,
    node_timeout: Duration,
}

impl CustodyCoordinator {
    pub fn new(
        store: Arc<dyn CustodyStore>,
        client: Arc<dyn NodeClient>,
        master_key: MasterKey,
        node_timeout: Duration,
    ) -> Self {
        Self {
            store,
            client,
            master_key,
            node_timeout,
        }
    }

    pub async fn register_node(&self, name: &str, endpoint: &str) -> Result<KeyShareNode> {
        if name.trim().is_empty() {
            return Err(Error::invalid("node name is empty"));
        }
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(Error::invalid(format!(
                "node endpoint must be an http(s) URL: {}",
                endpoint
            )));
        }

        let node = KeyShareNode::new(name.trim(), endpoint);
        self.store.insert_node(&node).await?;

        log_custody_event(
            "node_registered",
            &node.id.to_string(),
            true,
            serde_json::json!({ "name": node.name, "endpoint": node.endpoint }),
            None,
        );
        Ok(node)
    }

    pub async fn list_nodes(&self) -> Result<Vec<KeyShareNode>> {
        Ok(self.store.list_nodes().await?)
    }

    /// Take initial custody of a freshly generated server share
    pub async fn store_share(
        &self,
        wallet_id: &str,
        curve: Curve,
        share: &[u8],
        public_key: &str,
        node_ids: &[Uuid],
    ) -> Result<KeyShare> {
        self.require_wallet(wallet_id).await?;
        if self.store.get_key_share(wallet_id, curve).await?.is_some() {
            return Err(Error::Conflict(format!(
                "{} share for wallet {} already exists; reshare to replace it",
                curve, wallet_id
            )));
        }
        validate_material(curve, share, public_key, node_ids)?;

        let sealed = self.master_key.seal(&share_context(wallet_id, curve), share)?;
        let key_share = KeyShare::new(wallet_id, curve, sealed, public_key);
        self.store
            .insert_key_share(&key_share, node_ids)
            .await
            .map_err(|e| match e {
                StorageError::Duplicate(_) => Error::Conflict(format!(
                    "{} share for wallet {} already exists; reshare to replace it",
                    curve, wallet_id
                )),
                other => other.into(),
            })?;

        log_custody_event(
            "key_share_stored",
            wallet_id,
            true,
            serde_json::json!({ "curve": curve.to_string(), "nodes": node_ids.len() }),
            None,
        );
        Ok(key_share)
    }

    /// Unsealed server share for (wallet, curve)
    pub async fn load_share(&self, wallet_id: &str, curve: Curve) -> Result<Vec<u8>> {
        let share = self
            .store
            .get_key_share(wallet_id, curve)
            .await?
            .filter(|s| s.status == KeyShareStatus::Active)
            .ok_or_else(|| Error::NotFound(format!("{} share for wallet {}", curve, wallet_id)))?;

        Ok(self
            .master_key
            .open(&share_context(wallet_id, curve), &share.encrypted_share)?)
    }

    /// Succeeds only if every target node confirms it holds the share.
    ///
    /// Nodes are queried concurrently, each bounded by the node timeout. Any
    /// absence, error or silence is reported per node.
    pub async fn check_key_share_exists(
        &self,
        identity: &str,
        public_key: &str,
        target_nodes: &[Uuid],
    ) -> Result<()> {
        if target_nodes.is_empty() {
            return Err(Error::invalid("no target nodes given"));
        }

        let mut failures = Vec::new();
        let mut nodes = Vec::with_capacity(target_nodes.len());
        for node_id in target_nodes {
            match self.store.get_node(*node_id).await? {
                Some(node) => nodes.push(node),
                None => failures.push(NodeFailure {
                    node_id: *node_id,
                    node_name: "unregistered".to_string(),
                    reason: "node is not registered".to_string(),
                }),
            }
        }

        let timeout = self.node_timeout;
        let checks = nodes.iter().map(|node| async move {
            let result = tokio::time::timeout(
                timeout,
                self.client.key_share_exists(node, identity, public_key),
            )
            .await
            .unwrap_or(Err(NodeError::Timeout(timeout)));
            (node, result)
        });

        for (node, result) in join_all(checks).await {
            let reason = match result {
                Ok(true) => continue,
                Ok(false) => "share does not exist".to_string(),
                Err(e) => e.to_string(),
            };
            failures.push(NodeFailure {
                node_id: node.id,
                node_name: node.name.clone(),
                reason,
            });
        }

        if !failures.is_empty() {
            log_custody_event(
                "custody_check_failed",
                identity,
                false,
                serde_json::json!({ "failures": failures, "checked": target_nodes.len() }),
                Some("key share custody insufficient"),
            );
            return Err(Error::KeyshareInsufficient { failures });
        }

        tracing::debug!(
            target: "tss::custody",
            identity,
            nodes = target_nodes.len(),
            "All nodes confirmed key share custody"
        );
        Ok(())
    }

    /// Custody check against a wallet's recorded assignment
    pub async fn check_wallet_custody(&self, wallet_id: &str, curve: Curve) -> Result<()> {
        let share = self
            .store
            .get_key_share(wallet_id, curve)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{} share for wallet {}", curve, wallet_id)))?;
        let assignment = self
            .store
            .get_assignment(wallet_id, curve)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("{} node assignment for wallet {}", curve, wallet_id))
            })?;

        self.check_key_share_exists(wallet_id, &share.public_key, &assignment.node_ids)
            .await
    }

    /// Replace a wallet's shares after re-splitting.
    ///
    /// Each curve present in the request is replaced in its own store
    /// transaction. One curve failing does not undo the other.
    pub async fn reshare(&self, wallet_id: &str, request: ReshareRequest) -> Result<ReshareReport> {
        if request.secp256k1.is_none() && request.ed25519.is_none() {
            return Err(Error::invalid("reshare needs at least one curve"));
        }
        self.require_wallet(wallet_id).await?;

        let mut report = ReshareReport::default();
        let curves = [
            (Curve::Secp256k1, request.secp256k1),
            (Curve::Ed25519, request.ed25519),
        ];

        for (curve, material) in curves {
            let Some(material) = material else { continue };
            match self.reshare_curve(wallet_id, curve, material).await {
                Ok(share) => report.replaced.push(share),
                Err(e) => {
                    log_custody_event(
                        "reshare_failed",
                        wallet_id,
                        false,
                        serde_json::json!({ "curve": curve.to_string() }),
                        Some(&e.to_string()),
                    );
                    report.failed.push((curve, e));
                }
            }
        }

        Ok(report)
    }

    async fn reshare_curve(
        &self,
        wallet_id: &str,
        curve: Curve,
        material: CurveReshare,
    ) -> Result<KeyShare> {
        validate_material(curve, &material.server_share, &material.public_key, &material.node_ids)?;

        let context = share_context(wallet_id, curve);
        let current = self
            .store
            .get_key_share(wallet_id, curve)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{} share for wallet {}", curve, wallet_id)))?;

        if current.public_key != material.public_key {
            return Err(Error::invalid(format!(
                "{} reshare must keep public key {}",
                curve, current.public_key
            )));
        }
        let previous = self.master_key.open(&context, &current.encrypted_share)?;
        if previous == material.server_share {
            return Err(Error::invalid(format!(
                "{} reshare reuses the current server share",
                curve
            )));
        }

        let sealed = self.master_key.seal(&context, &material.server_share)?;
        let mut replacement = KeyShare::new(wallet_id, curve, sealed, material.public_key);
        replacement.id = current.id;
        replacement.created_at = current.created_at;
        self.store
            .replace_key_share(&replacement, &material.node_ids)
            .await?;

        log_custody_event(
            "key_share_reshared",
            wallet_id,
            true,
            serde_json::json!({ "curve": curve.to_string(), "nodes": material.node_ids.len() }),
            None,
        );
        Ok(replacement)
    }

    async fn require_wallet(&self, wallet_id: &str) -> Result<()> {
        self.store
            .get_wallet(wallet_id)
            .await?
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("wallet {}", wallet_id)))
    }
}

fn validate_material(curve: Curve, share: &[u8], public_key: &str, node_ids: &[Uuid]) -> Result<()> {
    if share.is_empty() {
        return Err(Error::invalid(format!("{} share is empty", curve)));
    }
    if node_ids.is_empty() {
        return Err(Error::invalid(format!("{} share needs at least one node", curve)));
    }
    let unique: HashSet<&Uuid> = node_ids.iter().collect();
    if unique.len() != node_ids.len() {
        return Err(Error::invalid(format!("{} node list has duplicates", curve)));
    }

    if curve == Curve::Ed25519 {
        let group_key = Ed25519ShareData::from_bytes(share)
            .and_then(|data| data.group_public_key())
            .map_err(|e| Error::invalid(format!("ed25519 share is not a key package: {}", e)))?;
        if group_key != public_key {
            return Err(Error::invalid(
                "ed25519 share does not belong to the given public key",
            ));
        }
    }
    Ok(())
}
