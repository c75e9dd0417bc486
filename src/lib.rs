//! Threshold Signing Session Engine and Key-Share Custody
//!
//! The server is one participant in 2-of-3 threshold signing sessions with a
//! customer's clients. It drives its side of each multi-round protocol one
//! stateless request at a time, persisting every intermediate result, and
//! keeps its own key shares sealed at rest.
//!
//! # Architecture
//!
//! - `protocol::EcdsaOrchestrator` - triples, presign, sign (secp256k1)
//! - `protocol::EddsaOrchestrator` - FROST commit, sign share, aggregate (ed25519)
//! - `custody::CustodyCoordinator` - sealed shares, node registry, resharing
//! - `keypair::KeypairManager` - versioned server signing keypair
//! - `runtime::Runtime` - node health sweeps and sealed backups
//!
//! # Usage
//!
//! ```bash
//! tss-custody rotate-keypair
//! tss-custody register-node --name node-1 --endpoint https://node-1.example.com
//! tss-custody run
//! ```

pub mod config;
pub mod custody;
pub mod error;
pub mod keypair;
pub mod keystore;
pub mod logging;
pub mod primitives;
pub mod protocol;
pub mod runtime;
pub mod storage;
pub mod types;

// Re-exports: orchestration
pub use protocol::{aggregate_signature, EcdsaOrchestrator, EddsaOrchestrator};
pub use primitives::{EcdsaPrimitives, EcdsaProtocol, PrimitiveError, SimulatedEcdsa};

// Re-exports: custody
pub use custody::{
    CurveReshare, CustodyCoordinator, HttpNodeClient, NodeClient, NodeError, ReshareReport,
    ReshareRequest,
};
pub use keypair::{KeypairManager, VersionedSignature};
pub use keystore::{Ed25519ShareData, KeystoreError, MasterKey};

// Re-exports: runtime and ambient
pub use config::{ConfigError, CustodyConfig};
pub use error::{Error, Result};
pub use runtime::{BackupManager, HealthMonitor, Runtime};
pub use storage::{CustodyStore, MemoryStore, SqliteStore, StorageError};
pub use types::*;
