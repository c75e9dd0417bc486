//! Custody types: key shares, key-share nodes, health checks, server keypairs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Curve a key share belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Curve {
    Secp256k1,
    Ed25519,
}

impl std::fmt::Display for Curve {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Secp256k1 => "SECP256K1",
            Self::Ed25519 => "ED25519",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for Curve {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SECP256K1" => Ok(Self::Secp256k1),
            "ED25519" => Ok(Self::Ed25519),
            _ => Err(format!("unknown curve: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyShareStatus {
    Active,
    Retired,
}

impl std::fmt::Display for KeyShareStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Retired => write!(f, "RETIRED"),
        }
    }
}

impl std::str::FromStr for KeyShareStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "RETIRED" => Ok(Self::Retired),
            _ => Err(format!("unknown key share status: {}", s)),
        }
    }
}

/// The server-held portion of a threshold key, one per (wallet, curve)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyShare {
    pub id: Uuid,
    pub wallet_id: String,
    pub curve: Curve,
    /// Sealed share bytes (see `keystore::MasterKey::seal`)
    pub encrypted_share: String,
    /// Group public key the share belongs to (hex)
    pub public_key: String,
    pub status: KeyShareStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl KeyShare {
    pub fn new(
        wallet_id: impl Into<String>,
        curve: Curve,
        encrypted_share: String,
        public_key: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            wallet_id: wallet_id.into(),
            curve,
            encrypted_share,
            public_key: public_key.into(),
            status: KeyShareStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Which nodes hold a wallet's shares for one curve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAssignment {
    pub wallet_id: String,
    pub curve: Curve,
    pub node_ids: Vec<Uuid>,
}

/// Health classification of a key-share node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    /// Never probed
    Unknown,
    Healthy,
    Unhealthy,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unknown => "UNKNOWN",
            Self::Healthy => "HEALTHY",
            Self::Unhealthy => "UNHEALTHY",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNKNOWN" => Ok(Self::Unknown),
            "HEALTHY" => Ok(Self::Healthy),
            "UNHEALTHY" => Ok(Self::Unhealthy),
            _ => Err(format!("unknown node status: {}", s)),
        }
    }
}

/// A registered, independently operated custody endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyShareNode {
    pub id: Uuid,
    pub name: String,
    /// Base URL, e.g. `https://node-1.example.com`
    pub endpoint: String,
    pub status: NodeStatus,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl KeyShareNode {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            endpoint: endpoint.into(),
            status: NodeStatus::Unknown,
            last_checked_at: None,
            created_at: Utc::now(),
        }
    }
}

/// One liveness probe result; health history is append-only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckRecord {
    pub id: Uuid,
    pub node_id: Uuid,
    pub status: NodeStatus,
    pub latency_ms: u64,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl HealthCheckRecord {
    pub fn healthy(node_id: Uuid, latency_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            node_id,
            status: NodeStatus::Healthy,
            latency_ms,
            error: None,
            checked_at: Utc::now(),
        }
    }

    pub fn unhealthy(node_id: Uuid, latency_ms: u64, error: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            node_id,
            status: NodeStatus::Unhealthy,
            latency_ms,
            error: Some(error.into()),
            checked_at: Utc::now(),
        }
    }
}

/// Why one node did not confirm custody
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub node_id: Uuid,
    pub node_name: String,
    pub reason: String,
}

impl std::fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.node_name, self.node_id, self.reason)
    }
}

/// The server's own signing keypair, versioned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerKeypair {
    pub id: Uuid,
    /// Assigned by the store on rotation; strictly increasing
    pub version: u32,
    /// SEC1 compressed secp256k1 public key (hex)
    pub public_key: String,
    /// Sealed private key scalar
    pub encrypted_private_key: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub rotated_at: Option<DateTime<Utc>>,
}

impl ServerKeypair {
    /// A not-yet-stored keypair; the store assigns `version` and `active`
    pub fn new(public_key: impl Into<String>, encrypted_private_key: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            version: 0,
            public_key: public_key.into(),
            encrypted_private_key,
            active: false,
            created_at: Utc::now(),
            rotated_at: None,
        }
    }
}
