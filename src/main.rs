//! TSS Custody CLI
//!
//! Operator entry point: runs the custody runtime and performs one-off
//! maintenance (keypair rotation, node registration, health checks, backups).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tss_custody::storage::NodeStore;
use tss_custody::{
    logging, BackupManager, CustodyConfig, CustodyCoordinator, CustodyStore, HealthMonitor,
    HttpNodeClient, KeypairManager, NodeStatus, Runtime, SqliteStore,
};

#[derive(Parser)]
#[command(name = "tss-custody")]
#[command(about = "Threshold signing session engine and key-share custody")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run health sweeps and backups until interrupted
    Run,

    /// Generate a new server keypair and retire the current one
    RotateKeypair,

    /// Register a key-share node
    RegisterNode {
        /// Unique node name
        #[arg(short, long)]
        name: String,

        /// Base URL (e.g., https://node-1.example.com)
        #[arg(short, long)]
        endpoint: String,
    },

    /// Probe every registered node once
    CheckNodes,

    /// Write a sealed backup, or inspect an existing one
    Backup {
        /// Unseal and summarize this backup instead of creating one
        #[arg(long)]
        restore: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    let config = CustodyConfig::from_env()?;
    logging::init_from_config(&config)?;

    let store: Arc<dyn CustodyStore> = Arc::new(SqliteStore::new(&config.database_path)?);
    let client = Arc::new(HttpNodeClient::new(config.node_timeout)?);

    match cli.command {
        Commands::Run => run(config, store, client).await?,
        Commands::RotateKeypair => {
            let keypair = KeypairManager::new(store, config.master_key.clone())
                .rotate()
                .await?;
            println!("Active keypair: version {} ({})", keypair.version, keypair.public_key);
        }
        Commands::RegisterNode { name, endpoint } => {
            let custody =
                CustodyCoordinator::new(store, client, config.master_key.clone(), config.node_timeout);
            let node = custody.register_node(&name, &endpoint).await?;
            println!("Registered node {} ({}) at {}", node.name, node.id, node.endpoint);
        }
        Commands::CheckNodes => {
            let nodes = store.list_nodes().await?;
            let records = HealthMonitor::new(store, client, config.node_timeout)
                .check_all()
                .await?;

            for (node, record) in nodes.iter().zip(&records) {
                let status = match record.status {
                    NodeStatus::Healthy => "healthy".to_string(),
                    _ => format!("UNHEALTHY: {}", record.error.as_deref().unwrap_or("unknown")),
                };
                println!("{:<20} {:>6}ms  {}", node.name, record.latency_ms, status);
            }
        }
        Commands::Backup { restore } => {
            let backups = BackupManager::new(
                store,
                config.master_key.clone(),
                &config.backup_dir,
                config.backup_retention_days,
            );

            match restore {
                Some(path) => {
                    let snapshot = backups.restore_snapshot(&path).await?;
                    println!("Backup taken at {}", snapshot.created_at);
                    println!("Key shares: {}", snapshot.key_shares.len());
                    println!("Node assignments: {}", snapshot.assignments.len());
                    println!("Server keypairs: {}", snapshot.keypairs.len());
                }
                None => {
                    let file = backups.create_backup().await?;
                    let retired = backups.retire_expired().await?;
                    println!("Wrote {}", file.path.display());
                    println!("Retired {} expired backup(s)", retired.len());
                }
            }
        }
    }

    Ok(())
}

async fn run(
    config: CustodyConfig,
    store: Arc<dyn CustodyStore>,
    client: Arc<HttpNodeClient>,
) -> Result<(), Box<dyn std::error::Error>> {
    config.print_summary();

    let keypairs = KeypairManager::new(store.clone(), config.master_key.clone());
    match keypairs.get_active().await? {
        Some(keypair) => tracing::info!(version = keypair.version, "Server keypair active"),
        None => tracing::warn!(
            "No server keypair provisioned; run `tss-custody rotate-keypair` before signing"
        ),
    }

    let runtime = Runtime::new(
        HealthMonitor::new(store.clone(), client, config.node_timeout),
        config.health_interval,
        BackupManager::new(
            store,
            config.master_key.clone(),
            &config.backup_dir,
            config.backup_retention_days,
        ),
        config.backup_interval,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
        }
        let _ = shutdown_tx.send(true);
    });

    runtime.run(shutdown_rx).await;
    Ok(())
}
