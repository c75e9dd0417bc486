//! Key-share custody: sealed server shares, node registry, resharing

pub mod coordinator;
pub mod node_client;

pub use coordinator::{CurveReshare, CustodyCoordinator, ReshareReport, ReshareRequest};
pub use node_client::{HttpNodeClient, NodeClient, NodeError};
