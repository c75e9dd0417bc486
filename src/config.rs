//! Environment-based configuration
//!
//! Secrets come from the environment only, never from files in the repo.
//!
//! # Required
//! - `TSS_MASTER_KEY` - 64 hex characters; seals key shares, keypairs and backups
//!
//! # Optional
//! - `TSS_DATABASE_PATH` - SQLite file (default: "tss-custody.db")
//! - `TSS_SERVER_PARTICIPANT` - this server's participant index (default: 2)
//! - `TSS_CLIENT_PARTICIPANTS` - comma-separated client indices (default: "0,1")
//! - `TSS_NODE_TIMEOUT_MS` - per-node request timeout (default: 5000)
//! - `TSS_HEALTH_INTERVAL_SECS` - health sweep interval (default: 30)
//! - `TSS_BACKUP_DIR` - backup directory (default: "backups")
//! - `TSS_BACKUP_INTERVAL_SECS` - backup interval (default: 3600)
//! - `TSS_BACKUP_RETENTION_DAYS` - backup retention (default: 30)
//! - `TSS_LOG_LEVEL` - trace, debug, info, warn, error (default: "info")
//! - `TSS_LOG_JSON` - "1" or "true" for JSON logs

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::keystore::MasterKey;
use crate::types::ParticipantId;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

#[derive(Debug, Clone)]
pub struct CustodyConfig {
    pub database_path: String,
    pub master_key: MasterKey,
    pub server_participant: ParticipantId,
    pub client_participants: Vec<ParticipantId>,
    pub node_timeout: Duration,
    pub health_interval: Duration,
    pub backup_dir: PathBuf,
    pub backup_interval: Duration,
    pub backup_retention_days: u32,
    pub log_level: String,
    pub log_json: bool,
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name.to_string(), value)),
        Err(_) => Ok(default),
    }
}

fn parse_participants(name: &str, value: &str) -> Result<Vec<ParticipantId>, ConfigError> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u16>()
                .map(ParticipantId)
                .map_err(|_| ConfigError::InvalidValue(name.to_string(), s.to_string()))
        })
        .collect()
}

impl CustodyConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let master_key_hex = env::var("TSS_MASTER_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("TSS_MASTER_KEY".to_string()))?;
        let master_key = MasterKey::from_hex(master_key_hex.trim())
            .map_err(|e| ConfigError::InvalidValue("TSS_MASTER_KEY".to_string(), e.to_string()))?;

        let client_participants = parse_participants(
            "TSS_CLIENT_PARTICIPANTS",
            &env::var("TSS_CLIENT_PARTICIPANTS").unwrap_or_else(|_| "0,1".to_string()),
        )?;

        let log_json = env::var("TSS_LOG_JSON")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let config = Self {
            database_path: env::var("TSS_DATABASE_PATH")
                .unwrap_or_else(|_| "tss-custody.db".to_string()),
            master_key,
            server_participant: ParticipantId(parse_var("TSS_SERVER_PARTICIPANT", 2u16)?),
            client_participants,
            node_timeout: Duration::from_millis(parse_var("TSS_NODE_TIMEOUT_MS", 5000u64)?),
            health_interval: Duration::from_secs(parse_var("TSS_HEALTH_INTERVAL_SECS", 30u64)?),
            backup_dir: PathBuf::from(
                env::var("TSS_BACKUP_DIR").unwrap_or_else(|_| "backups".to_string()),
            ),
            backup_interval: Duration::from_secs(parse_var("TSS_BACKUP_INTERVAL_SECS", 3600u64)?),
            backup_retention_days: parse_var("TSS_BACKUP_RETENTION_DAYS", 30u32)?,
            log_level: env::var("TSS_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_json,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the server unusable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client_participants.is_empty() {
            return Err(ConfigError::InvalidValue(
                "TSS_CLIENT_PARTICIPANTS".to_string(),
                "at least one client participant is required".to_string(),
            ));
        }

        if self.client_participants.contains(&self.server_participant) {
            return Err(ConfigError::InvalidValue(
                "TSS_SERVER_PARTICIPANT".to_string(),
                format!("{} is also listed as a client", self.server_participant),
            ));
        }

        let mut unique = self.client_participants.clone();
        unique.sort();
        unique.dedup();
        if unique.len() != self.client_participants.len() {
            return Err(ConfigError::InvalidValue(
                "TSS_CLIENT_PARTICIPANTS".to_string(),
                "duplicate participant".to_string(),
            ));
        }

        for (name, value) in [
            ("TSS_NODE_TIMEOUT_MS", self.node_timeout),
            ("TSS_HEALTH_INTERVAL_SECS", self.health_interval),
            ("TSS_BACKUP_INTERVAL_SECS", self.backup_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue(
                    name.to_string(),
                    "must be greater than zero".to_string(),
                ));
            }
        }

        if self.backup_retention_days == 0 {
            return Err(ConfigError::InvalidValue(
                "TSS_BACKUP_RETENTION_DAYS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Print configuration summary (hiding the master key)
    pub fn print_summary(&self) {
        let clients: Vec<String> = self
            .client_participants
            .iter()
            .map(|p| p.to_string())
            .collect();

        println!("=== TSS Custody Configuration ===");
        println!("Database: {}", self.database_path);
        println!("Master Key: <set>");
        println!("Server Participant: {}", self.server_participant);
        println!("Client Participants: {}", clients.join(", "));
        println!("Node Timeout: {:?}", self.node_timeout);
        println!("Health Interval: {:?}", self.health_interval);
        println!("Backup Dir: {}", self.backup_dir.display());
        println!("Backup Interval: {:?}", self.backup_interval);
        println!("Backup Retention: {} days", self.backup_retention_days);
        println!("Log Level: {}", self.log_level);
        println!("Log Format: {}", if self.log_json { "json" } else { "pretty" });
        println!("=================================");
    }
}
