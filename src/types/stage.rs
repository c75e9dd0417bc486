//! Stage types
//!
//! A stage is one protocol phase of a session. Each stage type has a fixed
//! number of steps; the stored status says how many are done:
//! STEP_1_COMPLETED → … → STEP_{n-1}_COMPLETED → COMPLETED, or FAILED from anywhere.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::session::SessionPurpose;

/// Protocol phase a stage runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageType {
    /// ECDSA triple generation (11 steps)
    Triples,
    /// ECDSA presignature (3 steps)
    Presign,
    /// ECDSA signature (2 steps)
    Sign,
    /// FROST commit, share, aggregate (3 steps)
    SignEd25519,
    /// Cached FROST round-1 commitment (1 step)
    PresignEd25519,
}

impl StageType {
    /// Number of steps before the stage is COMPLETED
    pub fn step_count(&self) -> u8 {
        match self {
            Self::Triples => 11,
            Self::Presign => 3,
            Self::Sign => 2,
            Self::SignEd25519 => 3,
            Self::PresignEd25519 => 1,
        }
    }

    pub fn purpose(&self) -> SessionPurpose {
        match self {
            Self::Triples | Self::Presign | Self::Sign => SessionPurpose::Ecdsa,
            Self::SignEd25519 | Self::PresignEd25519 => SessionPurpose::Ed25519,
        }
    }

    /// Completing this stage completes its session
    pub fn completes_session(&self) -> bool {
        matches!(self, Self::Sign | Self::SignEd25519)
    }
}

impl std::fmt::Display for StageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Triples => "TRIPLES",
            Self::Presign => "PRESIGN",
            Self::Sign => "SIGN",
            Self::SignEd25519 => "SIGN_ED25519",
            Self::PresignEd25519 => "PRESIGN_ED25519",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for StageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TRIPLES" => Ok(Self::Triples),
            "PRESIGN" => Ok(Self::Presign),
            "SIGN" => Ok(Self::Sign),
            "SIGN_ED25519" => Ok(Self::SignEd25519),
            "PRESIGN_ED25519" => Ok(Self::PresignEd25519),
            _ => Err(format!("unknown stage type: {}", s)),
        }
    }
}

/// How far a stage has progressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StageStatus {
    /// Steps 1..=n are done and the stage expects step n+1
    StepCompleted(u8),
    Completed,
    Failed,
}

impl StageStatus {
    /// Status after successfully running `step` of a `total`-step stage
    pub fn after_step(step: u8, total: u8) -> Self {
        if step >= total {
            Self::Completed
        } else {
            Self::StepCompleted(step)
        }
    }

    /// Steps already done, or `None` for a failed stage
    pub fn completed_steps(&self, total: u8) -> Option<u8> {
        match self {
            Self::StepCompleted(n) => Some(*n),
            Self::Completed => Some(total),
            Self::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Forward by exactly one step, or to FAILED from any non-terminal status
    pub fn can_transition_to(&self, next: &StageStatus, total: u8) -> bool {
        if self.is_terminal() {
            return false;
        }
        if *next == Self::Failed {
            return true;
        }
        match (self.completed_steps(total), next.completed_steps(total)) {
            (Some(done), Some(next_done)) => next_done == done + 1,
            _ => false,
        }
    }

    /// Reject statuses that cannot exist for a stage of `total` steps
    pub fn is_valid_for(&self, total: u8) -> bool {
        match self {
            Self::StepCompleted(n) => *n >= 1 && *n < total,
            _ => true,
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StepCompleted(n) => write!(f, "STEP_{}_COMPLETED", n),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

impl std::str::FromStr for StageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            _ => s
                .strip_prefix("STEP_")
                .and_then(|rest| rest.strip_suffix("_COMPLETED"))
                .and_then(|n| n.parse::<u8>().ok())
                .filter(|n| *n >= 1)
                .map(Self::StepCompleted)
                .ok_or_else(|| format!("unknown stage status: {}", s)),
        }
    }
}

impl From<StageStatus> for String {
    fn from(status: StageStatus) -> Self {
        status.to_string()
    }
}

impl TryFrom<String> for StageStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// One persisted protocol stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub id: Uuid,
    pub session_id: Uuid,
    pub stage_type: StageType,
    pub status: StageStatus,
    /// Opaque structured state owned by the orchestrator for this stage type
    pub payload: serde_json::Value,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Stage {
    pub fn new(
        session_id: Uuid,
        stage_type: StageType,
        status: StageStatus,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            session_id,
            stage_type,
            status,
            payload,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn step_count(&self) -> u8 {
        self.stage_type.step_count()
    }

    /// Steps already done, or `None` if failed
    pub fn completed_steps(&self) -> Option<u8> {
        self.status.completed_steps(self.step_count())
    }
}
