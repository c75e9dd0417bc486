//! Transport to key-share nodes
//!
//! Each node exposes an unauthenticated liveness probe and a share-existence
//! query:
//! - `GET {endpoint}/health`
//! - `POST {endpoint}/keyshare/exists` with `{identity, public_key}`, answering `{exists}`

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::types::KeyShareNode;

/// Node transport errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NodeError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Liveness probe
    async fn health(&self, node: &KeyShareNode) -> Result<(), NodeError>;

    /// Whether the node holds a share for `identity` under `public_key`
    async fn key_share_exists(
        &self,
        node: &KeyShareNode,
        identity: &str,
        public_key: &str,
    ) -> Result<bool, NodeError>;
}

#[derive(Debug, Serialize)]
struct ExistsRequest<'a> {
    identity: &'a str,
    public_key: &'a str,
}

#[derive(Debug, Deserialize)]
struct ExistsResponse {
    exists: bool,
}

/// reqwest-backed node client
pub struct HttpNodeClient {
    http_client: reqwest::Client,
}

impl HttpNodeClient {
    /// `timeout` bounds each request; callers may apply a tighter one
    pub fn new(timeout: Duration) -> Result<Self, NodeError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NodeError::Transport(e.to_string()))?;
        Ok(Self { http_client })
    }

    fn url(node: &KeyShareNode, path: &str) -> String {
        format!("{}{}", node.endpoint.trim_end_matches('/'), path)
    }
}

fn transport(e: reqwest::Error) -> NodeError {
    if e.is_timeout() {
        NodeError::Transport(format!("timed out: {}", e))
    } else {
        NodeError::Transport(e.to_string())
    }
}

#[async_trait]
impl NodeClient for HttpNodeClient {
    async fn health(&self, node: &KeyShareNode) -> Result<(), NodeError> {
        let response = self
            .http_client
            .get(Self::url(node, "/health"))
            .send()
            .await
            .map_err(transport)?;

        if !response.status().is_success() {
            return Err(NodeError::Status(response.status().as_u16()));
        }
        Ok(())
    }

    async fn key_share_exists(
        &self,
        node: &KeyShareNode,
        identity: &str,
        public_key: &str,
    ) -> Result<bool, NodeError> {
        let response = self
            .http_client
            .post(Self::url(node, "/keyshare/exists"))
            .json(&ExistsRequest {
                identity,
                public_key,
            })
            .send()
            .await
            .map_err(transport)?;

        if !response.status().is_success() {
            return Err(NodeError::Status(response.status().as_u16()));
        }

        let body: ExistsResponse = response
            .json()
            .await
            .map_err(|e| NodeError::InvalidResponse(e.to_string()))?;
        Ok(body.exists)
    }
}
