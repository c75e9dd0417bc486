//! In-Memory Storage Implementation
//!
//! Provides in-memory storage for testing and development.
//! Data is lost when the service restarts.
//!
//! All tables sit behind one lock so multi-record updates (reshare,
//! keypair rotation) are atomic the same way a SQLite transaction is.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::traits::{
    KeyShareStore, KeypairStore, NodeStore, SessionStore, StageStore, StorageError,
    StorageResult, WalletStore,
};
use crate::types::{
    Curve, HealthCheckRecord, KeyShare, KeyShareNode, NodeAssignment, ServerKeypair, Session,
    SessionPurpose, SessionState, Stage, StageStatus, StageType, Wallet,
};

#[derive(Default)]
struct Tables {
    wallets: HashMap<String, Wallet>,
    sessions: HashMap<Uuid, Session>,
    /// Index: (session id, stage type) -> stage
    stages: HashMap<(Uuid, StageType), Stage>,
    key_shares: HashMap<(String, Curve), KeyShare>,
    assignments: HashMap<(String, Curve), Vec<Uuid>>,
    keypairs: Vec<ServerKeypair>,
    nodes: HashMap<Uuid, KeyShareNode>,
    health: Vec<HealthCheckRecord>,
}

/// In-memory custody store
///
/// Thread-safe; clones share the same tables.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WalletStore for MemoryStore {
    async fn insert_wallet(&self, wallet: &Wallet) -> StorageResult<()> {
        let mut tables = self.tables.write().await;
        if tables.wallets.contains_key(&wallet.id) {
            return Err(StorageError::Duplicate(format!("wallet {}", wallet.id)));
        }
        tables.wallets.insert(wallet.id.clone(), wallet.clone());
        Ok(())
    }

    async fn get_wallet(&self, wallet_id: &str) -> StorageResult<Option<Wallet>> {
        let tables = self.tables.read().await;
        Ok(tables.wallets.get(wallet_id).cloned())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert_session(&self, session: &Session) -> StorageResult<()> {
        let mut tables = self.tables.write().await;

        if tables.sessions.contains_key(&session.id) {
            return Err(StorageError::Duplicate(format!("session {}", session.id)));
        }

        if session.state == SessionState::InProgress {
            let clash = tables.sessions.values().any(|s| {
                s.state == SessionState::InProgress
                    && s.wallet_id == session.wallet_id
                    && s.purpose == session.purpose
            });
            if clash {
                return Err(StorageError::Duplicate(format!(
                    "in-progress {} session for wallet {}",
                    session.purpose, session.wallet_id
                )));
            }
        }

        tables.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> StorageResult<Option<Session>> {
        let tables = self.tables.read().await;
        Ok(tables.sessions.get(&id).cloned())
    }

    async fn active_session(
        &self,
        wallet_id: &str,
        purpose: SessionPurpose,
    ) -> StorageResult<Option<Session>> {
        let tables = self.tables.read().await;
        Ok(tables
            .sessions
            .values()
            .find(|s| {
                s.state == SessionState::InProgress && s.wallet_id == wallet_id && s.purpose == purpose
            })
            .cloned())
    }

    async fn finish_session(
        &self,
        id: Uuid,
        state: SessionState,
        error: Option<&str>,
    ) -> StorageResult<()> {
        let mut tables = self.tables.write().await;
        let session = tables
            .sessions
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("session {}", id)))?;

        if session.state.is_terminal() {
            return Err(StorageError::Conflict(format!(
                "session {} already {}",
                id, session.state
            )));
        }

        session.state = state;
        session.error = error.map(str::to_string);
        session.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl StageStore for MemoryStore {
    async fn insert_stage(&self, stage: &Stage) -> StorageResult<()> {
        let mut tables = self.tables.write().await;
        let key = (stage.session_id, stage.stage_type);
        if tables.stages.contains_key(&key) {
            return Err(StorageError::Duplicate(format!(
                "{} stage for session {}",
                stage.stage_type, stage.session_id
            )));
        }
        tables.stages.insert(key, stage.clone());
        Ok(())
    }

    async fn get_stage(
        &self,
        session_id: Uuid,
        stage_type: StageType,
    ) -> StorageResult<Option<Stage>> {
        let tables = self.tables.read().await;
        Ok(tables.stages.get(&(session_id, stage_type)).cloned())
    }

    async fn list_stages(&self, session_id: Uuid) -> StorageResult<Vec<Stage>> {
        let tables = self.tables.read().await;
        let mut stages: Vec<Stage> = tables
            .stages
            .values()
            .filter(|s| s.session_id == session_id)
            .cloned()
            .collect();
        stages.sort_by_key(|s| s.created_at);
        Ok(stages)
    }

    async fn update_stage(&self, stage: &Stage, expected: StageStatus) -> StorageResult<()> {
        let mut tables = self.tables.write().await;
        let current = tables
            .stages
            .get_mut(&(stage.session_id, stage.stage_type))
            .ok_or_else(|| StorageError::NotFound(format!("stage {}", stage.id)))?;

        if current.status != expected {
            return Err(StorageError::Conflict(format!(
                "stage {} is {}, expected {}",
                stage.id, current.status, expected
            )));
        }

        let mut updated = stage.clone();
        updated.updated_at = Utc::now();
        *current = updated;
        Ok(())
    }
}

#[async_trait]
impl KeyShareStore for MemoryStore {
    async fn get_key_share(&self, wallet_id: &str, curve: Curve) -> StorageResult<Option<KeyShare>> {
        let tables = self.tables.read().await;
        Ok(tables.key_shares.get(&(wallet_id.to_string(), curve)).cloned())
    }

    async fn insert_key_share(&self, share: &KeyShare, node_ids: &[Uuid]) -> StorageResult<()> {
        let mut tables = self.tables.write().await;

        if let Some(missing) = node_ids.iter().find(|id| !tables.nodes.contains_key(id)) {
            return Err(StorageError::NotFound(format!("node {}", missing)));
        }

        let key = (share.wallet_id.clone(), share.curve);
        if tables.key_shares.contains_key(&key) {
            return Err(StorageError::Duplicate(format!(
                "{} share for wallet {}",
                share.curve, share.wallet_id
            )));
        }

        tables.key_shares.insert(key.clone(), share.clone());
        tables.assignments.insert(key, node_ids.to_vec());
        Ok(())
    }

    async fn replace_key_share(&self, share: &KeyShare, node_ids: &[Uuid]) -> StorageResult<()> {
        let mut tables = self.tables.write().await;

        if let Some(missing) = node_ids.iter().find(|id| !tables.nodes.contains_key(id)) {
            return Err(StorageError::NotFound(format!("node {}", missing)));
        }

        let key = (share.wallet_id.clone(), share.curve);
        let mut stored = share.clone();
        if let Some(previous) = tables.key_shares.get(&key) {
            stored.id = previous.id;
            stored.created_at = previous.created_at;
        }
        stored.updated_at = Utc::now();

        tables.key_shares.insert(key.clone(), stored);
        tables.assignments.insert(key, node_ids.to_vec());
        Ok(())
    }

    async fn get_assignment(
        &self,
        wallet_id: &str,
        curve: Curve,
    ) -> StorageResult<Option<NodeAssignment>> {
        let tables = self.tables.read().await;
        Ok(tables
            .assignments
            .get(&(wallet_id.to_string(), curve))
            .map(|node_ids| NodeAssignment {
                wallet_id: wallet_id.to_string(),
                curve,
                node_ids: node_ids.clone(),
            }))
    }

    async fn list_key_shares(&self) -> StorageResult<Vec<KeyShare>> {
        let tables = self.tables.read().await;
        Ok(tables.key_shares.values().cloned().collect())
    }

    async fn list_assignments(&self) -> StorageResult<Vec<NodeAssignment>> {
        let tables = self.tables.read().await;
        Ok(tables
            .assignments
            .iter()
            .map(|((wallet_id, curve), node_ids)| NodeAssignment {
                wallet_id: wallet_id.clone(),
                curve: *curve,
                node_ids: node_ids.clone(),
            })
            .collect())
    }
}

#[async_trait]
impl KeypairStore for MemoryStore {
    async fn active_keypair(&self) -> StorageResult<Option<ServerKeypair>> {
        let tables = self.tables.read().await;
        Ok(tables.keypairs.iter().find(|k| k.active).cloned())
    }

    async fn keypair_by_version(&self, version: u32) -> StorageResult<Option<ServerKeypair>> {
        let tables = self.tables.read().await;
        Ok(tables.keypairs.iter().find(|k| k.version == version).cloned())
    }

    async fn rotate_keypair(&self, keypair: &ServerKeypair) -> StorageResult<ServerKeypair> {
        let mut tables = self.tables.write().await;
        let now = Utc::now();

        let next_version = tables.keypairs.iter().map(|k| k.version).max().unwrap_or(0) + 1;

        for existing in tables.keypairs.iter_mut().filter(|k| k.active) {
            existing.active = false;
            existing.rotated_at = Some(now);
        }

        let mut stored = keypair.clone();
        stored.version = next_version;
        stored.active = true;
        stored.rotated_at = None;
        tables.keypairs.push(stored.clone());

        Ok(stored)
    }

    async fn list_keypairs(&self) -> StorageResult<Vec<ServerKeypair>> {
        let tables = self.tables.read().await;
        let mut keypairs = tables.keypairs.clone();
        keypairs.sort_by_key(|k| k.version);
        Ok(keypairs)
    }
}

#[async_trait]
impl NodeStore for MemoryStore {
    async fn insert_node(&self, node: &KeyShareNode) -> StorageResult<()> {
        let mut tables = self.tables.write().await;
        if tables.nodes.values().any(|n| n.id == node.id || n.name == node.name) {
            return Err(StorageError::Duplicate(format!("node {}", node.name)));
        }
        tables.nodes.insert(node.id, node.clone());
        Ok(())
    }

    async fn get_node(&self, id: Uuid) -> StorageResult<Option<KeyShareNode>> {
        let tables = self.tables.read().await;
        Ok(tables.nodes.get(&id).cloned())
    }

    async fn list_nodes(&self) -> StorageResult<Vec<KeyShareNode>> {
        let tables = self.tables.read().await;
        let mut nodes: Vec<KeyShareNode> = tables.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(nodes)
    }

    async fn record_health(&self, record: &HealthCheckRecord) -> StorageResult<()> {
        let mut tables = self.tables.write().await;
        let node = tables
            .nodes
            .get_mut(&record.node_id)
            .ok_or_else(|| StorageError::NotFound(format!("node {}", record.node_id)))?;

        node.status = record.status;
        node.last_checked_at = Some(record.checked_at);
        tables.health.push(record.clone());
        Ok(())
    }

    async fn health_history(&self, node_id: Uuid, limit: usize) -> StorageResult<Vec<HealthCheckRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .health
            .iter()
            .rev()
            .filter(|r| r.node_id == node_id)
            .take(limit)
            .cloned()
            .collect())
    }
}
