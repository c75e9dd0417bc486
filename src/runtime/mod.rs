//! Background runtime: node health sweeps and sealed backups

pub mod backup;
pub mod health;

pub use backup::{BackupFile, BackupManager, BackupSnapshot};
pub use health::HealthMonitor;

use std::time::Duration;
use tokio::sync::watch;

/// Runs the health monitor and backup manager side by side until shutdown
pub struct Runtime {
    health: HealthMonitor,
    health_interval: Duration,
    backup: BackupManager,
    backup_interval: Duration,
}

impl Runtime {
    pub fn new(
        health: HealthMonitor,
        health_interval: Duration,
        backup: BackupManager,
        backup_interval: Duration,
    ) -> Self {
        Self {
            health,
            health_interval,
            backup,
            backup_interval,
        }
    }

    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        tracing::info!(
            health_interval_secs = self.health_interval.as_secs(),
            backup_interval_secs = self.backup_interval.as_secs(),
            "Custody runtime started"
        );

        tokio::join!(
            self.health.run(self.health_interval, shutdown.clone()),
            self.backup.run(self.backup_interval, shutdown),
        );

        tracing::info!("Custody runtime stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custody::node_client::MockNodeClient;
    use crate::keystore::MasterKey;
    use crate::storage::MemoryStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_runtime_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let runtime = Runtime::new(
            HealthMonitor::new(store.clone(), Arc::new(MockNodeClient::new()), Duration::from_millis(50)),
            Duration::from_secs(60),
            BackupManager::new(store, MasterKey::generate(), dir.path(), 7),
            Duration::from_secs(60),
        );

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { runtime.run(rx).await });

        // First tick fires immediately and writes one backup
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        let backups = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(backups, 1);
    }
}
