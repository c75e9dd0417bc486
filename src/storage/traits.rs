//! Storage Trait Definitions
//!
//! Defines abstract storage interfaces for sessions, stages and custody records.
//! Implementations can use SQLite (production) or in-memory (testing).
//!
//! Invariants the stores enforce at the data layer:
//! - one IN_PROGRESS session per (wallet, purpose)
//! - one stage per (session, stage type); updates are compare-and-swap on status
//! - one key share per (wallet, curve); resharing replaces in place
//! - at most one active server keypair; rotation swaps atomically

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::types::{
    Curve, HealthCheckRecord, KeyShare, KeyShareNode, NodeAssignment, ServerKeypair, Session,
    SessionPurpose, SessionState, Stage, StageStatus, StageType, Wallet,
};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    /// A compare-and-swap guard did not match
    #[error("Concurrent modification: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Connection error: {0}")]
    Connection(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Wallet ownership records
#[async_trait]
pub trait WalletStore: Send + Sync {
    async fn insert_wallet(&self, wallet: &Wallet) -> StorageResult<()>;

    async fn get_wallet(&self, wallet_id: &str) -> StorageResult<Option<Wallet>>;
}

/// Session storage interface
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new session; `Duplicate` if the wallet already has an
    /// in-progress session for the same purpose
    async fn insert_session(&self, session: &Session) -> StorageResult<()>;

    async fn get_session(&self, id: Uuid) -> StorageResult<Option<Session>>;

    /// The in-progress session for (wallet, purpose), if any
    async fn active_session(
        &self,
        wallet_id: &str,
        purpose: SessionPurpose,
    ) -> StorageResult<Option<Session>>;

    /// Move an IN_PROGRESS session to a terminal state; `Conflict` if it is
    /// already terminal
    async fn finish_session(
        &self,
        id: Uuid,
        state: SessionState,
        error: Option<&str>,
    ) -> StorageResult<()>;
}

/// Stage storage interface
#[async_trait]
pub trait StageStore: Send + Sync {
    /// Insert a new stage; `Duplicate` if the session already has one of this type
    async fn insert_stage(&self, stage: &Stage) -> StorageResult<()>;

    async fn get_stage(
        &self,
        session_id: Uuid,
        stage_type: StageType,
    ) -> StorageResult<Option<Stage>>;

    async fn list_stages(&self, session_id: Uuid) -> StorageResult<Vec<Stage>>;

    /// Write `stage` only if the stored status still equals `expected`;
    /// `Conflict` otherwise
    async fn update_stage(&self, stage: &Stage, expected: StageStatus) -> StorageResult<()>;
}

/// Server-held key shares and their node assignments
#[async_trait]
pub trait KeyShareStore: Send + Sync {
    async fn get_key_share(&self, wallet_id: &str, curve: Curve) -> StorageResult<Option<KeyShare>>;

    /// Insert the first share for (wallet, curve) with its node assignment;
    /// `Duplicate` if one already exists
    async fn insert_key_share(&self, share: &KeyShare, node_ids: &[Uuid]) -> StorageResult<()>;

    /// Replace the (wallet, curve) share and its node assignment in one transaction
    async fn replace_key_share(&self, share: &KeyShare, node_ids: &[Uuid]) -> StorageResult<()>;

    async fn get_assignment(
        &self,
        wallet_id: &str,
        curve: Curve,
    ) -> StorageResult<Option<NodeAssignment>>;

    async fn list_key_shares(&self) -> StorageResult<Vec<KeyShare>>;

    async fn list_assignments(&self) -> StorageResult<Vec<NodeAssignment>>;
}

/// Versioned server signing keypairs
#[async_trait]
pub trait KeypairStore: Send + Sync {
    async fn active_keypair(&self) -> StorageResult<Option<ServerKeypair>>;

    async fn keypair_by_version(&self, version: u32) -> StorageResult<Option<ServerKeypair>>;

    /// Deactivate the current keypair and activate `keypair` as the next
    /// version, atomically. Returns the stored keypair.
    async fn rotate_keypair(&self, keypair: &ServerKeypair) -> StorageResult<ServerKeypair>;

    async fn list_keypairs(&self) -> StorageResult<Vec<ServerKeypair>>;
}

/// Key-share node registry and health history
#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn insert_node(&self, node: &KeyShareNode) -> StorageResult<()>;

    async fn get_node(&self, id: Uuid) -> StorageResult<Option<KeyShareNode>>;

    async fn list_nodes(&self) -> StorageResult<Vec<KeyShareNode>>;

    /// Append a health record and update the node's status with it
    async fn record_health(&self, record: &HealthCheckRecord) -> StorageResult<()>;

    /// Most recent health records for a node, newest first
    async fn health_history(&self, node_id: Uuid, limit: usize) -> StorageResult<Vec<HealthCheckRecord>>;
}

/// Everything the engine persists
pub trait CustodyStore:
    WalletStore + SessionStore + StageStore + KeyShareStore + KeypairStore + NodeStore
{
}

impl<T> CustodyStore for T where
    T: WalletStore + SessionStore + StageStore + KeyShareStore + KeypairStore + NodeStore
{
}
