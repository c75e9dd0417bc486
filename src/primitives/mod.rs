//! Threshold ECDSA primitive contract
//!
//! The curve arithmetic for triples, presignatures and signatures lives
//! outside this crate. The orchestrator drives it one step at a time through
//! [`EcdsaPrimitives::step`] with opaque bytes in and out: the state persisted
//! after the previous step, the inbound peer messages the step consumes, and
//! (on step 1) a seed. Any implementation honoring this contract, including an
//! FFI binding, can be plugged in without touching the stage machinery.

pub mod simulated;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ParticipantId, StageType};

pub use simulated::SimulatedEcdsa;

/// The three ECDSA protocols the orchestrator sequences
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EcdsaProtocol {
    Triples,
    Presign,
    Sign,
}

impl EcdsaProtocol {
    pub fn stage_type(&self) -> StageType {
        match self {
            Self::Triples => StageType::Triples,
            Self::Presign => StageType::Presign,
            Self::Sign => StageType::Sign,
        }
    }

    pub fn step_count(&self) -> u8 {
        self.stage_type().step_count()
    }
}

impl std::fmt::Display for EcdsaProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.stage_type(), f)
    }
}

/// A peer message handed to the primitive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub round: u8,
    pub from: ParticipantId,
    pub payload: Vec<u8>,
}

/// A message the primitive wants delivered to a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub round: u8,
    pub to: ParticipantId,
    pub payload: Vec<u8>,
}

/// Input to one local step
#[derive(Debug, Clone)]
pub struct StepInput {
    pub protocol: EcdsaProtocol,
    /// 1-indexed step number
    pub step: u8,
    pub me: ParticipantId,
    /// Every participant, including `me`
    pub participants: Vec<ParticipantId>,
    /// State returned by the previous step; `None` on step 1
    pub state: Option<Vec<u8>>,
    /// Messages for the rounds this step consumes
    pub inbox: Vec<InboundMessage>,
    /// Step-1 seed: [`PresignSeed`] or [`SignSeed`] bytes; `None` for triples
    pub seed: Option<Vec<u8>>,
}

/// Result of one local step
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    /// State to persist for the next step
    pub state: Vec<u8>,
    pub outbox: Vec<OutboundMessage>,
    /// Private terminal output (triple share, presignature share); final step only
    pub output: Option<Vec<u8>>,
    /// Public terminal output (triple commitment, big R, signature); final step only
    pub public_output: Option<Vec<u8>>,
}

/// Primitive failures are terminal for the stage
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PrimitiveError {
    /// The protocol aborted
    #[error("protocol abort: {0}")]
    Abort(String),
    /// A cross-participant consistency check failed
    #[error("consistency check failed: {0}")]
    Consistency(String),
    /// State or message bytes could not be decoded
    #[error("malformed input: {0}")]
    Malformed(String),
}

/// One local step of a threshold ECDSA protocol
pub trait EcdsaPrimitives: Send + Sync {
    fn step(&self, input: StepInput) -> Result<StepOutput, PrimitiveError>;
}

/// Seed for presign step 1
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresignSeed {
    /// Private triple output of this participant (hex)
    pub triple_output: String,
    /// This participant's secp256k1 key share (hex)
    pub key_share: String,
}

/// Seed for sign step 1
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignSeed {
    /// Private presignature output of this participant (hex)
    pub presign_output: String,
    /// 32-byte message hash (hex)
    pub message_hash: String,
}

impl PresignSeed {
    pub fn to_bytes(&self) -> Result<Vec<u8>, PrimitiveError> {
        serde_json::to_vec(self).map_err(|e| PrimitiveError::Malformed(e.to_string()))
    }
}

impl SignSeed {
    pub fn to_bytes(&self) -> Result<Vec<u8>, PrimitiveError> {
        serde_json::to_vec(self).map_err(|e| PrimitiveError::Malformed(e.to_string()))
    }
}
