//! Request and response types exchanged with clients across the round boundary
//!
//! All binary payloads are hex-encoded.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::stage::{StageStatus, StageType};

/// Stable index of a protocol participant (client share 0, client share 1, server, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub u16);

impl std::fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// A single peer-to-peer protocol message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMessage {
    /// Round that produced the message
    pub round: u8,
    pub from: ParticipantId,
    pub to: ParticipantId,
    /// Primitive-library payload (hex)
    pub payload: String,
}

/// ECDSA round request (triples, presign, sign)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundRequest {
    pub session_id: Uuid,
    /// Caller identity, checked against session ownership
    pub customer_id: String,
    /// Step the caller wants to run (1-indexed)
    pub step: u8,
    /// Peer messages addressed to the server
    #[serde(default)]
    pub messages: Vec<PeerMessage>,
    /// 32-byte message hash (hex); only for step 1 of SIGN
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_hash: Option<String>,
}

/// ECDSA round response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundResponse {
    pub session_id: Uuid,
    pub stage: StageType,
    pub step: u8,
    pub status: StageStatus,
    /// Messages the server emits for its peers
    pub messages: Vec<PeerMessage>,
    /// Terminal public result (triple public data, presignature R, signature)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// True when this step had already run and the stored outcome is returned
    pub replayed: bool,
}

/// Participant-tagged FROST payload (commitment or signature share)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifiedPayload {
    /// FROST identifier (hex)
    pub identifier: String,
    pub payload: String,
}

/// Caller identity for session-level calls that carry no protocol data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequest {
    pub session_id: Uuid,
    pub customer_id: String,
}

/// Server round-1 commitment (presign or sign step 1)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ed25519CommitResponse {
    pub session_id: Uuid,
    /// Server FROST identifier (hex)
    pub identifier: String,
    /// Server signing commitment (hex)
    pub commitment: String,
    /// True if the commitment came from a cached presign
    pub presigned: bool,
    pub replayed: bool,
}

/// Sign step 2: client commitments and the message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ed25519SignRequest {
    pub session_id: Uuid,
    pub customer_id: String,
    /// Message to sign (hex)
    pub message: String,
    /// Client commitments, any order
    pub commitments: Vec<IdentifiedPayload>,
}

/// Server signature share
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ed25519ShareResponse {
    pub session_id: Uuid,
    pub identifier: String,
    pub signature_share: String,
    pub replayed: bool,
}

/// Sign step 3: client signature shares
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ed25519AggregateRequest {
    pub session_id: Uuid,
    pub customer_id: String,
    /// Client shares, any order
    pub signature_shares: Vec<IdentifiedPayload>,
}

/// Final verified signature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ed25519SignatureResponse {
    pub session_id: Uuid,
    /// 64-byte signature (hex)
    pub signature: String,
    /// Group verifying key (hex)
    pub verifying_key: String,
    pub replayed: bool,
}

/// Generic error response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Stable error code
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Optional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}
