//! Storage Layer Module
//!
//! Provides persistence for sessions, stages and custody records.
//!
//! This module contains:
//! - Storage trait definitions for abstraction
//! - SQLite implementation for production
//! - In-memory implementation for testing

pub mod memory;
pub mod sqlite;
pub mod traits;

// Re-exports for convenience
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{
    CustodyStore, KeyShareStore, KeypairStore, NodeStore, SessionStore, StageStore, StorageError,
    StorageResult, WalletStore,
};
