//! Sealed custody backups
//!
//! A backup is one JSON snapshot of every key share, node assignment and
//! server keypair, sealed as a whole under the master key and written to
//! `backup-<unix millis>.enc`. Share and keypair columns are already sealed
//! individually, so a snapshot is encrypted twice.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::keystore::MasterKey;
use crate::logging::log_custody_event;
use crate::storage::CustodyStore;
use crate::types::{KeyShare, NodeAssignment, ServerKeypair};

const BACKUP_CONTEXT: &str = "backup";
const BACKUP_PREFIX: &str = "backup-";
const BACKUP_SUFFIX: &str = ".enc";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupSnapshot {
    pub created_at: DateTime<Utc>,
    pub key_shares: Vec<KeyShare>,
    pub assignments: Vec<NodeAssignment>,
    pub keypairs: Vec<ServerKeypair>,
}

/// A backup file on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupFile {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> Error {
    Error::internal(format!("{} {}: {}", action, path.display(), e))
}

/// Timestamp encoded in a backup file name, if the name is one of ours
fn parse_backup_name(name: &str) -> Option<DateTime<Utc>> {
    let millis: i64 = name
        .strip_prefix(BACKUP_PREFIX)?
        .strip_suffix(BACKUP_SUFFIX)?
        .parse()
        .ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

pub struct BackupManager {
    store: Arc<dyn CustodyStore>,
    master_key: MasterKey,
    dir: PathBuf,
    retention: ChronoDuration,
}

impl BackupManager {
    pub fn new(
        store: Arc<dyn CustodyStore>,
        master_key: MasterKey,
        dir: impl Into<PathBuf>,
        retention_days: u32,
    ) -> Self {
        Self {
            store,
            master_key,
            dir: dir.into(),
            retention: ChronoDuration::days(retention_days as i64),
        }
    }

    async fn snapshot(&self) -> Result<BackupSnapshot> {
        Ok(BackupSnapshot {
            created_at: Utc::now(),
            key_shares: self.store.list_key_shares().await?,
            assignments: self.store.list_assignments().await?,
            keypairs: self.store.list_keypairs().await?,
        })
    }

    /// Write a new sealed snapshot and return its file
    pub async fn create_backup(&self) -> Result<BackupFile> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_error("create backup dir", &self.dir, e))?;

        let snapshot = self.snapshot().await?;
        let plaintext = serde_json::to_vec(&snapshot)
            .map_err(|e| Error::internal(format!("serialize snapshot: {}", e)))?;
        let sealed = self.master_key.seal(BACKUP_CONTEXT, &plaintext)?;

        // Millisecond names can collide when backups are taken back to back
        let mut millis = snapshot.created_at.timestamp_millis();
        let path = loop {
            let candidate = self
                .dir
                .join(format!("{}{}{}", BACKUP_PREFIX, millis, BACKUP_SUFFIX));
            if !tokio::fs::try_exists(&candidate)
                .await
                .map_err(|e| io_error("stat", &candidate, e))?
            {
                break candidate;
            }
            millis += 1;
        };

        tokio::fs::write(&path, sealed.as_bytes())
            .await
            .map_err(|e| io_error("write", &path, e))?;

        log_custody_event(
            "backup_created",
            &path.display().to_string(),
            true,
            serde_json::json!({
                "key_shares": snapshot.key_shares.len(),
                "keypairs": snapshot.keypairs.len(),
            }),
            None,
        );

        let created_at = Utc
            .timestamp_millis_opt(millis)
            .single()
            .unwrap_or(snapshot.created_at);
        Ok(BackupFile { path, created_at })
    }

    /// Backups in the backup directory, newest first
    pub async fn list_backups(&self) -> Result<Vec<BackupFile>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error("read backup dir", &self.dir, e)),
        };

        let mut backups = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("read backup dir", &self.dir, e))?
        {
            let name = entry.file_name();
            if let Some(created_at) = name.to_str().and_then(parse_backup_name) {
                backups.push(BackupFile {
                    path: entry.path(),
                    created_at,
                });
            }
        }

        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(backups)
    }

    /// Delete backups older than the retention window. The newest backup is
    /// always kept, however old.
    pub async fn retire_expired(&self) -> Result<Vec<BackupFile>> {
        let cutoff = Utc::now() - self.retention;
        let mut retired = Vec::new();

        for backup in self.list_backups().await?.into_iter().skip(1) {
            if backup.created_at < cutoff {
                tokio::fs::remove_file(&backup.path)
                    .await
                    .map_err(|e| io_error("remove", &backup.path, e))?;
                retired.push(backup);
            }
        }

        if !retired.is_empty() {
            tracing::info!(target: "tss::custody", count = retired.len(), "Retired expired backups");
        }
        Ok(retired)
    }

    /// Unseal a backup file for inspection or manual recovery
    pub async fn restore_snapshot(&self, path: &Path) -> Result<BackupSnapshot> {
        let sealed = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| io_error("read", path, e))?;
        let plaintext = self.master_key.open(BACKUP_CONTEXT, &sealed)?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| Error::internal(format!("corrupt snapshot {}: {}", path.display(), e)))
    }

    /// Back up and retire every `interval` until `shutdown` flips to true
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let result = match self.create_backup().await {
                        Ok(_) => self.retire_expired().await.map(|_| ()),
                        Err(e) => Err(e),
                    };
                    if let Err(e) = result {
                        tracing::error!(target: "tss::custody", error = %e, "Backup cycle failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keypair::KeypairManager;
    use crate::storage::MemoryStore;

    fn manager(dir: &Path, key: MasterKey) -> (Arc<MemoryStore>, BackupManager) {
        let store = Arc::new(MemoryStore::new());
        let backups = BackupManager::new(store.clone(), key, dir, 7);
        (store, backups)
    }

    #[test]
    fn test_backup_name_parsing() {
        assert!(parse_backup_name("backup-1700000000000.enc").is_some());
        assert!(parse_backup_name("backup-abc.enc").is_none());
        assert!(parse_backup_name("notes.txt").is_none());
    }

    #[tokio::test]
    async fn test_backup_roundtrip_is_sealed() {
        let dir = tempfile::tempdir().unwrap();
        let key = MasterKey::generate();
        let (store, backups) = manager(dir.path(), key.clone());

        KeypairManager::new(store.clone(), key).rotate().await.unwrap();
        let file = backups.create_backup().await.unwrap();

        let raw = std::fs::read_to_string(&file.path).unwrap();
        assert!(!raw.contains("keypairs"));

        let snapshot = backups.restore_snapshot(&file.path).await.unwrap();
        assert_eq!(snapshot.keypairs.len(), 1);
        assert_eq!(snapshot.keypairs[0].version, 1);
    }

    #[tokio::test]
    async fn test_wrong_key_cannot_restore() {
        let dir = tempfile::tempdir().unwrap();
        let (_, backups) = manager(dir.path(), MasterKey::generate());
        let file = backups.create_backup().await.unwrap();

        let (_, other) = manager(dir.path(), MasterKey::generate());
        assert!(other.restore_snapshot(&file.path).await.is_err());
    }

    #[tokio::test]
    async fn test_retire_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let (_, backups) = manager(dir.path(), MasterKey::generate());

        // Two stale backups, 30 and 20 days old
        for days in [30, 20] {
            let millis = (Utc::now() - ChronoDuration::days(days)).timestamp_millis();
            std::fs::write(dir.path().join(format!("backup-{}.enc", millis)), "stale").unwrap();
        }
        std::fs::write(dir.path().join("unrelated.txt"), "keep").unwrap();

        let retired = backups.retire_expired().await.unwrap();
        assert_eq!(retired.len(), 1);
        let remaining = backups.list_backups().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(dir.path().join("unrelated.txt").exists());

        let fresh = backups.create_backup().await.unwrap();
        let retired = backups.retire_expired().await.unwrap();
        assert_eq!(retired.len(), 1);
        assert_eq!(backups.list_backups().await.unwrap(), vec![fresh]);
    }

    #[tokio::test]
    async fn test_missing_dir_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (_, backups) = manager(&dir.path().join("absent"), MasterKey::generate());
        assert!(backups.list_backups().await.unwrap().is_empty());
    }
}
