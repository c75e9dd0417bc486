//! SQLite Persistent Storage
//!
//! Provides durable storage for sessions, stages and custody records.
//! Uses connection pooling via r2d2 for concurrent access.
//!
//! Data-layer invariants are enforced by indexes, not application locks:
//! - `idx_sessions_active`: one IN_PROGRESS session per (wallet, purpose)
//! - `idx_keypairs_active`: at most one active server keypair
//! - `UNIQUE(session_id, stage_type)` and `UNIQUE(wallet_id, curve)`

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

use super::traits::{
    KeyShareStore, KeypairStore, NodeStore, SessionStore, StageStore, StorageError,
    StorageResult, WalletStore,
};
use crate::types::{
    Curve, HealthCheckRecord, KeyShare, KeyShareNode, NodeAssignment, ServerKeypair, Session,
    SessionPurpose, SessionState, Stage, StageStatus, StageType, Wallet,
};

/// SQLite-backed custody store with connection pooling
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

fn db_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::Database(e.to_string())
}

/// Map unique-constraint failures to `Duplicate`
fn insert_err(e: rusqlite::Error, what: impl Into<String>) -> StorageError {
    if let rusqlite::Error::SqliteFailure(ref err, _) = e {
        if err.extended_code == 1555 || err.extended_code == 2067 {
            return StorageError::Duplicate(what.into());
        }
    }
    db_err(e)
}

fn ts(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_ts(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

/// Read a TEXT column and parse it
fn parse_col<T>(row: &rusqlite::Row, name: &str) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.get(name)?;
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            row.as_ref().column_index(name).unwrap_or(0),
            rusqlite::types::Type::Text,
            Box::new(StorageError::InvalidData(format!("{}: {}", name, e))),
        )
    })
}

impl SqliteStore {
    /// Create a new store with the given database path
    ///
    /// Creates the database file and runs migrations if needed.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, StorageError> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(|c| {
            c.execute_batch("PRAGMA busy_timeout = 5000; PRAGMA journal_mode = WAL;")
        });
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations()?;

        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations()?;

        Ok(store)
    }

    /// Get a connection from the pool
    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StorageError> {
        self.pool
            .get()
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS wallets (
                id TEXT PRIMARY KEY,
                customer_id TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                customer_id TEXT NOT NULL,
                wallet_id TEXT NOT NULL,
                purpose TEXT NOT NULL,
                state TEXT NOT NULL,
                error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_active
                ON sessions(wallet_id, purpose) WHERE state = 'IN_PROGRESS';

            CREATE TABLE IF NOT EXISTS stages (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES sessions(id),
                stage_type TEXT NOT NULL,
                status TEXT NOT NULL,
                payload TEXT NOT NULL,
                error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(session_id, stage_type)
            );

            CREATE TABLE IF NOT EXISTS key_shares (
                id TEXT PRIMARY KEY,
                wallet_id TEXT NOT NULL,
                curve TEXT NOT NULL,
                encrypted_share TEXT NOT NULL,
                public_key TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(wallet_id, curve)
            );

            CREATE TABLE IF NOT EXISTS node_assignments (
                wallet_id TEXT NOT NULL,
                curve TEXT NOT NULL,
                node_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                PRIMARY KEY (wallet_id, curve, node_id)
            );

            CREATE TABLE IF NOT EXISTS server_keypairs (
                id TEXT PRIMARY KEY,
                version INTEGER NOT NULL UNIQUE,
                public_key TEXT NOT NULL,
                encrypted_private_key TEXT NOT NULL,
                active INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                rotated_at INTEGER
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_keypairs_active
                ON server_keypairs(active) WHERE active = 1;

            CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                endpoint TEXT NOT NULL,
                status TEXT NOT NULL,
                last_checked_at INTEGER,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS health_checks (
                id TEXT PRIMARY KEY,
                node_id TEXT NOT NULL REFERENCES nodes(id),
                status TEXT NOT NULL,
                latency_ms INTEGER NOT NULL,
                error TEXT,
                checked_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_health_checks_node ON health_checks(node_id, checked_at);
            "#,
        )
        .map_err(db_err)?;

        Ok(())
    }

    // Row conversions

    fn row_to_wallet(row: &rusqlite::Row) -> rusqlite::Result<Wallet> {
        Ok(Wallet {
            id: row.get("id")?,
            customer_id: row.get("customer_id")?,
            created_at: from_ts(row.get("created_at")?),
        })
    }

    fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<Session> {
        Ok(Session {
            id: parse_col(row, "id")?,
            customer_id: row.get("customer_id")?,
            wallet_id: row.get("wallet_id")?,
            purpose: parse_col(row, "purpose")?,
            state: parse_col(row, "state")?,
            error: row.get("error")?,
            created_at: from_ts(row.get("created_at")?),
            updated_at: from_ts(row.get("updated_at")?),
        })
    }

    fn row_to_stage(row: &rusqlite::Row) -> rusqlite::Result<Stage> {
        let payload: String = row.get("payload")?;
        let payload = serde_json::from_str(&payload).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(StorageError::InvalidData(format!("payload: {}", e))),
            )
        })?;

        Ok(Stage {
            id: parse_col(row, "id")?,
            session_id: parse_col(row, "session_id")?,
            stage_type: parse_col(row, "stage_type")?,
            status: parse_col(row, "status")?,
            payload,
            error: row.get("error")?,
            created_at: from_ts(row.get("created_at")?),
            updated_at: from_ts(row.get("updated_at")?),
        })
    }

    fn row_to_key_share(row: &rusqlite::Row) -> rusqlite::Result<KeyShare> {
        Ok(KeyShare {
            id: parse_col(row, "id")?,
            wallet_id: row.get("wallet_id")?,
            curve: parse_col(row, "curve")?,
            encrypted_share: row.get("encrypted_share")?,
            public_key: row.get("public_key")?,
            status: parse_col(row, "status")?,
            created_at: from_ts(row.get("created_at")?),
            updated_at: from_ts(row.get("updated_at")?),
        })
    }

    fn row_to_keypair(row: &rusqlite::Row) -> rusqlite::Result<ServerKeypair> {
        Ok(ServerKeypair {
            id: parse_col(row, "id")?,
            version: row.get::<_, i64>("version")? as u32,
            public_key: row.get("public_key")?,
            encrypted_private_key: row.get("encrypted_private_key")?,
            active: row.get::<_, i64>("active")? == 1,
            created_at: from_ts(row.get("created_at")?),
            rotated_at: row.get::<_, Option<i64>>("rotated_at")?.map(from_ts),
        })
    }

    fn row_to_node(row: &rusqlite::Row) -> rusqlite::Result<KeyShareNode> {
        Ok(KeyShareNode {
            id: parse_col(row, "id")?,
            name: row.get("name")?,
            endpoint: row.get("endpoint")?,
            status: parse_col(row, "status")?,
            last_checked_at: row.get::<_, Option<i64>>("last_checked_at")?.map(from_ts),
            created_at: from_ts(row.get("created_at")?),
        })
    }

    fn row_to_health(row: &rusqlite::Row) -> rusqlite::Result<HealthCheckRecord> {
        Ok(HealthCheckRecord {
            id: parse_col(row, "id")?,
            node_id: parse_col(row, "node_id")?,
            status: parse_col(row, "status")?,
            latency_ms: row.get::<_, i64>("latency_ms")? as u64,
            error: row.get("error")?,
            checked_at: from_ts(row.get("checked_at")?),
        })
    }

    // Synchronous helper methods for the trait implementations

    fn insert_wallet_sync(&self, wallet: &Wallet) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO wallets (id, customer_id, created_at) VALUES (?1, ?2, ?3)",
            params![wallet.id, wallet.customer_id, ts(&wallet.created_at)],
        )
        .map_err(|e| insert_err(e, format!("wallet {}", wallet.id)))?;
        Ok(())
    }

    fn get_wallet_sync(&self, wallet_id: &str) -> StorageResult<Option<Wallet>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM wallets WHERE id = ?1",
            params![wallet_id],
            Self::row_to_wallet,
        )
        .optional()
        .map_err(db_err)
    }

    fn insert_session_sync(&self, session: &Session) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO sessions (
                id, customer_id, wallet_id, purpose, state, error, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                session.id.to_string(),
                session.customer_id,
                session.wallet_id,
                session.purpose.to_string(),
                session.state.to_string(),
                session.error,
                ts(&session.created_at),
                ts(&session.updated_at),
            ],
        )
        .map_err(|e| {
            insert_err(
                e,
                format!(
                    "in-progress {} session for wallet {}",
                    session.purpose, session.wallet_id
                ),
            )
        })?;
        Ok(())
    }

    fn get_session_sync(&self, id: Uuid) -> StorageResult<Option<Session>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM sessions WHERE id = ?1",
            params![id.to_string()],
            Self::row_to_session,
        )
        .optional()
        .map_err(db_err)
    }

    fn active_session_sync(
        &self,
        wallet_id: &str,
        purpose: SessionPurpose,
    ) -> StorageResult<Option<Session>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM sessions WHERE wallet_id = ?1 AND purpose = ?2 AND state = 'IN_PROGRESS'",
            params![wallet_id, purpose.to_string()],
            Self::row_to_session,
        )
        .optional()
        .map_err(db_err)
    }

    fn finish_session_sync(
        &self,
        id: Uuid,
        state: SessionState,
        error: Option<&str>,
    ) -> StorageResult<()> {
        let conn = self.conn()?;
        let rows_affected = conn
            .execute(
                r#"
                UPDATE sessions SET state = ?2, error = ?3, updated_at = ?4
                WHERE id = ?1 AND state = 'IN_PROGRESS'
                "#,
                params![id.to_string(), state.to_string(), error, ts(&Utc::now())],
            )
            .map_err(db_err)?;

        if rows_affected == 0 {
            let exists: bool = conn
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM sessions WHERE id = ?1)",
                    params![id.to_string()],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            return Err(if exists {
                StorageError::Conflict(format!("session {} already terminal", id))
            } else {
                StorageError::NotFound(format!("session {}", id))
            });
        }

        Ok(())
    }

    fn insert_stage_sync(&self, stage: &Stage) -> StorageResult<()> {
        let conn = self.conn()?;
        let payload = serde_json::to_string(&stage.payload)
            .map_err(|e| StorageError::InvalidData(e.to_string()))?;

        conn.execute(
            r#"
            INSERT INTO stages (
                id, session_id, stage_type, status, payload, error, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                stage.id.to_string(),
                stage.session_id.to_string(),
                stage.stage_type.to_string(),
                stage.status.to_string(),
                payload,
                stage.error,
                ts(&stage.created_at),
                ts(&stage.updated_at),
            ],
        )
        .map_err(|e| {
            insert_err(
                e,
                format!("{} stage for session {}", stage.stage_type, stage.session_id),
            )
        })?;
        Ok(())
    }

    fn get_stage_sync(&self, session_id: Uuid, stage_type: StageType) -> StorageResult<Option<Stage>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM stages WHERE session_id = ?1 AND stage_type = ?2",
            params![session_id.to_string(), stage_type.to_string()],
            Self::row_to_stage,
        )
        .optional()
        .map_err(db_err)
    }

    fn list_stages_sync(&self, session_id: Uuid) -> StorageResult<Vec<Stage>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT * FROM stages WHERE session_id = ?1 ORDER BY created_at ASC")
            .map_err(db_err)?;

        let stages = stmt
            .query_map(params![session_id.to_string()], Self::row_to_stage)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        Ok(stages)
    }

    fn update_stage_sync(&self, stage: &Stage, expected: StageStatus) -> StorageResult<()> {
        let conn = self.conn()?;
        let payload = serde_json::to_string(&stage.payload)
            .map_err(|e| StorageError::InvalidData(e.to_string()))?;

        let rows_affected = conn
            .execute(
                r#"
                UPDATE stages SET status = ?3, payload = ?4, error = ?5, updated_at = ?6
                WHERE session_id = ?1 AND stage_type = ?2 AND status = ?7
                "#,
                params![
                    stage.session_id.to_string(),
                    stage.stage_type.to_string(),
                    stage.status.to_string(),
                    payload,
                    stage.error,
                    ts(&Utc::now()),
                    expected.to_string(),
                ],
            )
            .map_err(db_err)?;

        if rows_affected == 0 {
            let current: Option<String> = conn
                .query_row(
                    "SELECT status FROM stages WHERE session_id = ?1 AND stage_type = ?2",
                    params![stage.session_id.to_string(), stage.stage_type.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            return Err(match current {
                Some(status) => StorageError::Conflict(format!(
                    "stage {} is {}, expected {}",
                    stage.id, status, expected
                )),
                None => StorageError::NotFound(format!("stage {}", stage.id)),
            });
        }

        Ok(())
    }

    fn get_key_share_sync(&self, wallet_id: &str, curve: Curve) -> StorageResult<Option<KeyShare>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM key_shares WHERE wallet_id = ?1 AND curve = ?2",
            params![wallet_id, curve.to_string()],
            Self::row_to_key_share,
        )
        .optional()
        .map_err(db_err)
    }

    /// Write a share and its assignment; without `overwrite` an existing
    /// (wallet, curve) row is a `Duplicate`
    fn write_key_share_sync(
        &self,
        share: &KeyShare,
        node_ids: &[Uuid],
        overwrite: bool,
    ) -> StorageResult<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        for node_id in node_ids {
            let exists: bool = tx
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM nodes WHERE id = ?1)",
                    params![node_id.to_string()],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            if !exists {
                return Err(StorageError::NotFound(format!("node {}", node_id)));
            }
        }

        let insert = r#"
            INSERT INTO key_shares (
                id, wallet_id, curve, encrypted_share, public_key, status, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#;
        let upsert = r#"
            INSERT INTO key_shares (
                id, wallet_id, curve, encrypted_share, public_key, status, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(wallet_id, curve) DO UPDATE SET
                encrypted_share = excluded.encrypted_share,
                public_key = excluded.public_key,
                status = excluded.status,
                updated_at = excluded.updated_at
            "#;
        tx.execute(
            if overwrite { upsert } else { insert },
            params![
                share.id.to_string(),
                share.wallet_id,
                share.curve.to_string(),
                share.encrypted_share,
                share.public_key,
                share.status.to_string(),
                ts(&share.created_at),
                ts(&Utc::now()),
            ],
        )
        .map_err(|e| {
            insert_err(
                e,
                format!("{} share for wallet {}", share.curve, share.wallet_id),
            )
        })?;

        tx.execute(
            "DELETE FROM node_assignments WHERE wallet_id = ?1 AND curve = ?2",
            params![share.wallet_id, share.curve.to_string()],
        )
        .map_err(db_err)?;

        for (position, node_id) in node_ids.iter().enumerate() {
            tx.execute(
                r#"
                INSERT INTO node_assignments (wallet_id, curve, node_id, position)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![
                    share.wallet_id,
                    share.curve.to_string(),
                    node_id.to_string(),
                    position as i64,
                ],
            )
            .map_err(|e| insert_err(e, format!("node {} listed twice", node_id)))?;
        }

        tx.commit().map_err(db_err)?;
        Ok(())
    }

    fn get_assignment_sync(&self, wallet_id: &str, curve: Curve) -> StorageResult<Option<NodeAssignment>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT node_id FROM node_assignments
                WHERE wallet_id = ?1 AND curve = ?2
                ORDER BY position ASC
                "#,
            )
            .map_err(db_err)?;

        let node_ids = stmt
            .query_map(params![wallet_id, curve.to_string()], |row| parse_col(row, "node_id"))
            .map_err(db_err)?
            .collect::<Result<Vec<Uuid>, _>>()
            .map_err(db_err)?;

        if node_ids.is_empty() {
            return Ok(None);
        }

        Ok(Some(NodeAssignment {
            wallet_id: wallet_id.to_string(),
            curve,
            node_ids,
        }))
    }

    fn list_key_shares_sync(&self) -> StorageResult<Vec<KeyShare>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT * FROM key_shares ORDER BY wallet_id, curve")
            .map_err(db_err)?;
        let shares = stmt
            .query_map([], Self::row_to_key_share)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(shares)
    }

    fn list_assignments_sync(&self) -> StorageResult<Vec<NodeAssignment>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT wallet_id, curve, node_id FROM node_assignments ORDER BY wallet_id, curve, position",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>("wallet_id")?,
                    parse_col::<Curve>(row, "curve")?,
                    parse_col::<Uuid>(row, "node_id")?,
                ))
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        let mut assignments: Vec<NodeAssignment> = Vec::new();
        for (wallet_id, curve, node_id) in rows {
            match assignments.last_mut() {
                Some(last) if last.wallet_id == wallet_id && last.curve == curve => {
                    last.node_ids.push(node_id)
                }
                _ => assignments.push(NodeAssignment {
                    wallet_id,
                    curve,
                    node_ids: vec![node_id],
                }),
            }
        }
        Ok(assignments)
    }

    fn active_keypair_sync(&self) -> StorageResult<Option<ServerKeypair>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM server_keypairs WHERE active = 1",
            [],
            Self::row_to_keypair,
        )
        .optional()
        .map_err(db_err)
    }

    fn keypair_by_version_sync(&self, version: u32) -> StorageResult<Option<ServerKeypair>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM server_keypairs WHERE version = ?1",
            params![version as i64],
            Self::row_to_keypair,
        )
        .optional()
        .map_err(db_err)
    }

    fn rotate_keypair_sync(&self, keypair: &ServerKeypair) -> StorageResult<ServerKeypair> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let now = Utc::now();

        let next_version: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(version), 0) + 1 FROM server_keypairs",
                [],
                |row| row.get(0),
            )
            .map_err(db_err)?;

        tx.execute(
            "UPDATE server_keypairs SET active = 0, rotated_at = ?1 WHERE active = 1",
            params![ts(&now)],
        )
        .map_err(db_err)?;

        tx.execute(
            r#"
            INSERT INTO server_keypairs (
                id, version, public_key, encrypted_private_key, active, created_at, rotated_at
            ) VALUES (?1, ?2, ?3, ?4, 1, ?5, NULL)
            "#,
            params![
                keypair.id.to_string(),
                next_version,
                keypair.public_key,
                keypair.encrypted_private_key,
                ts(&keypair.created_at),
            ],
        )
        .map_err(|e| insert_err(e, format!("keypair version {}", next_version)))?;

        tx.commit().map_err(db_err)?;

        let mut stored = keypair.clone();
        stored.version = next_version as u32;
        stored.active = true;
        stored.rotated_at = None;
        Ok(stored)
    }

    fn list_keypairs_sync(&self) -> StorageResult<Vec<ServerKeypair>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT * FROM server_keypairs ORDER BY version ASC")
            .map_err(db_err)?;
        let keypairs = stmt
            .query_map([], Self::row_to_keypair)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(keypairs)
    }

    fn insert_node_sync(&self, node: &KeyShareNode) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO nodes (id, name, endpoint, status, last_checked_at, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                node.id.to_string(),
                node.name,
                node.endpoint,
                node.status.to_string(),
                node.last_checked_at.as_ref().map(ts),
                ts(&node.created_at),
            ],
        )
        .map_err(|e| insert_err(e, format!("node {}", node.name)))?;
        Ok(())
    }

    fn get_node_sync(&self, id: Uuid) -> StorageResult<Option<KeyShareNode>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM nodes WHERE id = ?1",
            params![id.to_string()],
            Self::row_to_node,
        )
        .optional()
        .map_err(db_err)
    }

    fn list_nodes_sync(&self) -> StorageResult<Vec<KeyShareNode>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT * FROM nodes ORDER BY name ASC")
            .map_err(db_err)?;
        let nodes = stmt
            .query_map([], Self::row_to_node)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(nodes)
    }

    fn record_health_sync(&self, record: &HealthCheckRecord) -> StorageResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;

        let rows_affected = tx
            .execute(
                "UPDATE nodes SET status = ?2, last_checked_at = ?3 WHERE id = ?1",
                params![
                    record.node_id.to_string(),
                    record.status.to_string(),
                    ts(&record.checked_at),
                ],
            )
            .map_err(db_err)?;
        if rows_affected == 0 {
            return Err(StorageError::NotFound(format!("node {}", record.node_id)));
        }

        tx.execute(
            r#"
            INSERT INTO health_checks (id, node_id, status, latency_ms, error, checked_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                record.id.to_string(),
                record.node_id.to_string(),
                record.status.to_string(),
                record.latency_ms as i64,
                record.error,
                ts(&record.checked_at),
            ],
        )
        .map_err(db_err)?;

        tx.commit().map_err(db_err)?;
        Ok(())
    }

    fn health_history_sync(&self, node_id: Uuid, limit: usize) -> StorageResult<Vec<HealthCheckRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT * FROM health_checks WHERE node_id = ?1
                ORDER BY checked_at DESC, rowid DESC
                LIMIT ?2
                "#,
            )
            .map_err(db_err)?;
        let records = stmt
            .query_map(params![node_id.to_string(), limit as i64], Self::row_to_health)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(records)
    }
}

#[async_trait]
impl WalletStore for SqliteStore {
    async fn insert_wallet(&self, wallet: &Wallet) -> StorageResult<()> {
        self.insert_wallet_sync(wallet)
    }

    async fn get_wallet(&self, wallet_id: &str) -> StorageResult<Option<Wallet>> {
        self.get_wallet_sync(wallet_id)
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn insert_session(&self, session: &Session) -> StorageResult<()> {
        self.insert_session_sync(session)
    }

    async fn get_session(&self, id: Uuid) -> StorageResult<Option<Session>> {
        self.get_session_sync(id)
    }

    async fn active_session(
        &self,
        wallet_id: &str,
        purpose: SessionPurpose,
    ) -> StorageResult<Option<Session>> {
        self.active_session_sync(wallet_id, purpose)
    }

    async fn finish_session(
        &self,
        id: Uuid,
        state: SessionState,
        error: Option<&str>,
    ) -> StorageResult<()> {
        self.finish_session_sync(id, state, error)
    }
}

#[async_trait]
impl StageStore for SqliteStore {
    async fn insert_stage(&self, stage: &Stage) -> StorageResult<()> {
        self.insert_stage_sync(stage)
    }

    async fn get_stage(
        &self,
        session_id: Uuid,
        stage_type: StageType,
    ) -> StorageResult<Option<Stage>> {
        self.get_stage_sync(session_id, stage_type)
    }

    async fn list_stages(&self, session_id: Uuid) -> StorageResult<Vec<Stage>> {
        self.list_stages_sync(session_id)
    }

    async fn update_stage(&self, stage: &Stage, expected: StageStatus) -> StorageResult<()> {
        self.update_stage_sync(stage, expected)
    }
}

#[async_trait]
impl KeyShareStore for SqliteStore {
    async fn get_key_share(&self, wallet_id: &str, curve: Curve) -> StorageResult<Option<KeyShare>> {
        self.get_key_share_sync(wallet_id, curve)
    }

    async fn insert_key_share(&self, share: &KeyShare, node_ids: &[Uuid]) -> StorageResult<()> {
        self.write_key_share_sync(share, node_ids, false)
    }

    async fn replace_key_share(&self, share: &KeyShare, node_ids: &[Uuid]) -> StorageResult<()> {
        self.write_key_share_sync(share, node_ids, true)
    }

    async fn get_assignment(
        &self,
        wallet_id: &str,
        curve: Curve,
    ) -> StorageResult<Option<NodeAssignment>> {
        self.get_assignment_sync(wallet_id, curve)
    }

    async fn list_key_shares(&self) -> StorageResult<Vec<KeyShare>> {
        self.list_key_shares_sync()
    }

    async fn list_assignments(&self) -> StorageResult<Vec<NodeAssignment>> {
        self.list_assignments_sync()
    }
}

#[async_trait]
impl KeypairStore for SqliteStore {
    async fn active_keypair(&self) -> StorageResult<Option<ServerKeypair>> {
        self.active_keypair_sync()
    }

    async fn keypair_by_version(&self, version: u32) -> StorageResult<Option<ServerKeypair>> {
        self.keypair_by_version_sync(version)
    }

    async fn rotate_keypair(&self, keypair: &ServerKeypair) -> StorageResult<ServerKeypair> {
        self.rotate_keypair_sync(keypair)
    }

    async fn list_keypairs(&self) -> StorageResult<Vec<ServerKeypair>> {
        self.list_keypairs_sync()
    }
}

#[async_trait]
impl NodeStore for SqliteStore {
    async fn insert_node(&self, node: &KeyShareNode) -> StorageResult<()> {
        self.insert_node_sync(node)
    }

    async fn get_node(&self, id: Uuid) -> StorageResult<Option<KeyShareNode>> {
        self.get_node_sync(id)
    }

    async fn list_nodes(&self) -> StorageResult<Vec<KeyShareNode>> {
        self.list_nodes_sync()
    }

    async fn record_health(&self, record: &HealthCheckRecord) -> StorageResult<()> {
        self.record_health_sync(record)
    }

    async fn health_history(&self, node_id: Uuid, limit: usize) -> StorageResult<Vec<HealthCheckRecord>> {
        self.health_history_sync(node_id, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeStatus;

    #[tokio::test]
    async fn test_session_round_trip_and_active_index() {
        let store = SqliteStore::in_memory().unwrap();
        let session = Session::new("cust", "wallet-1", SessionPurpose::Ecdsa);
        store.insert_session(&session).await.unwrap();

        let loaded = store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.state, SessionState::InProgress);

        let clash = Session::new("cust", "wallet-1", SessionPurpose::Ecdsa);
        assert!(matches!(
            store.insert_session(&clash).await,
            Err(StorageError::Duplicate(_))
        ));

        store
            .finish_session(session.id, SessionState::Aborted, Some("user cancelled"))
            .await
            .unwrap();
        store.insert_session(&clash).await.unwrap();

        let active = store
            .active_session("wallet-1", SessionPurpose::Ecdsa)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.id, clash.id);
    }

    #[tokio::test]
    async fn test_finish_terminal_session_conflicts() {
        let store = SqliteStore::in_memory().unwrap();
        let session = Session::new("cust", "wallet-1", SessionPurpose::Ed25519);
        store.insert_session(&session).await.unwrap();
        store
            .finish_session(session.id, SessionState::Completed, None)
            .await
            .unwrap();

        let again = store
            .finish_session(session.id, SessionState::Failed, Some("late"))
            .await;
        assert!(matches!(again, Err(StorageError::Conflict(_))));

        let missing = store
            .finish_session(Uuid::new_v4(), SessionState::Failed, None)
            .await;
        assert!(matches!(missing, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_stage_compare_and_swap() {
        let store = SqliteStore::in_memory().unwrap();
        let session_id = Uuid::new_v4();
        let mut stage = Stage::new(
            session_id,
            StageType::Triples,
            StageStatus::StepCompleted(1),
            serde_json::json!({"state": "aa"}),
        );
        store.insert_stage(&stage).await.unwrap();

        stage.status = StageStatus::StepCompleted(2);
        stage.payload = serde_json::json!({"state": "bb"});
        store
            .update_stage(&stage, StageStatus::StepCompleted(1))
            .await
            .unwrap();

        let stale = store.update_stage(&stage, StageStatus::StepCompleted(1)).await;
        assert!(matches!(stale, Err(StorageError::Conflict(_))));

        let loaded = store
            .get_stage(session_id, StageType::Triples)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, StageStatus::StepCompleted(2));
        assert_eq!(loaded.payload["state"], "bb");
    }

    #[tokio::test]
    async fn test_rotation_swaps_active_flag() {
        let store = SqliteStore::in_memory().unwrap();
        let v1 = store
            .rotate_keypair(&ServerKeypair::new("pk1", "sealed1".to_string()))
            .await
            .unwrap();
        let v2 = store
            .rotate_keypair(&ServerKeypair::new("pk2", "sealed2".to_string()))
            .await
            .unwrap();
        assert_eq!((v1.version, v2.version), (1, 2));

        let all = store.list_keypairs().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all.iter().filter(|k| k.active).count(), 1);
        assert!(!all[0].active);
        assert!(all[0].rotated_at.is_some());

        let old = store.keypair_by_version(1).await.unwrap().unwrap();
        assert_eq!(old.public_key, "pk1");
    }

    #[tokio::test]
    async fn test_replace_key_share_and_assignment() {
        let store = SqliteStore::in_memory().unwrap();
        let a = KeyShareNode::new("node-a", "http://a");
        let b = KeyShareNode::new("node-b", "http://b");
        store.insert_node(&a).await.unwrap();
        store.insert_node(&b).await.unwrap();

        let first = KeyShare::new("w1", Curve::Ed25519, "sealed-1".to_string(), "pk");
        store.replace_key_share(&first, &[a.id]).await.unwrap();
        let second = KeyShare::new("w1", Curve::Ed25519, "sealed-2".to_string(), "pk");
        store.replace_key_share(&second, &[b.id, a.id]).await.unwrap();

        let shares = store.list_key_shares().await.unwrap();
        assert_eq!(shares.len(), 1);
        assert_eq!(shares[0].encrypted_share, "sealed-2");

        let assignment = store
            .get_assignment("w1", Curve::Ed25519)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(assignment.node_ids, vec![b.id, a.id]);

        // Unknown node rolls back the whole replacement
        let third = KeyShare::new("w1", Curve::Ed25519, "sealed-3".to_string(), "pk");
        let result = store.replace_key_share(&third, &[Uuid::new_v4()]).await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
        let kept = store.get_key_share("w1", Curve::Ed25519).await.unwrap().unwrap();
        assert_eq!(kept.encrypted_share, "sealed-2");
    }

    #[tokio::test]
    async fn test_insert_key_share_never_overwrites() {
        let store = SqliteStore::in_memory().unwrap();
        let node = KeyShareNode::new("node-a", "http://a");
        store.insert_node(&node).await.unwrap();

        let first = KeyShare::new("w1", Curve::Secp256k1, "sealed-1".to_string(), "pk");
        store.insert_key_share(&first, &[node.id]).await.unwrap();

        let second = KeyShare::new("w1", Curve::Secp256k1, "sealed-2".to_string(), "pk");
        let result = store.insert_key_share(&second, &[]).await;
        assert!(matches!(result, Err(StorageError::Duplicate(_))));

        let kept = store.get_key_share("w1", Curve::Secp256k1).await.unwrap().unwrap();
        assert_eq!(kept.id, first.id);
        assert_eq!(kept.encrypted_share, "sealed-1");
        let assignment = store
            .get_assignment("w1", Curve::Secp256k1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(assignment.node_ids, vec![node.id]);
    }

    #[tokio::test]
    async fn test_health_history_is_kept() {
        let store = SqliteStore::in_memory().unwrap();
        let node = KeyShareNode::new("node-a", "http://a");
        store.insert_node(&node).await.unwrap();

        store
            .record_health(&HealthCheckRecord::healthy(node.id, 12))
            .await
            .unwrap();
        store
            .record_health(&HealthCheckRecord::unhealthy(node.id, 5000, "timeout"))
            .await
            .unwrap();

        let history = store.health_history(node.id, 10).await.unwrap();
        assert_eq!(history.len(), 2);

        let loaded = store.get_node(node.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, NodeStatus::Unhealthy);
        assert!(loaded.last_checked_at.is_some());
    }
}
