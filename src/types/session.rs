//! Session and wallet types
//!
//! A session groups one wallet + customer to an ordered sequence of protocol
//! stages. Session state is monotonic:
//! in_progress → completed | failed | aborted

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which threshold scheme a session drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionPurpose {
    /// Threshold ECDSA over secp256k1 (triples → presign → sign)
    Ecdsa,
    /// FROST over ed25519 (optional presign → sign)
    Ed25519,
}

impl std::fmt::Display for SessionPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ecdsa => "ECDSA",
            Self::Ed25519 => "ED25519",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for SessionPurpose {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ECDSA" => Ok(Self::Ecdsa),
            "ED25519" => Ok(Self::Ed25519),
            _ => Err(format!("unknown session purpose: {}", s)),
        }
    }
}

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    InProgress,
    Completed,
    Failed,
    Aborted,
}

impl SessionState {
    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Aborted => "ABORTED",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "ABORTED" => Ok(Self::Aborted),
            _ => Err(format!("unknown session state: {}", s)),
        }
    }
}

/// One signing or key-generation engagement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub customer_id: String,
    pub wallet_id: String,
    pub purpose: SessionPurpose,
    pub state: SessionState,
    /// Why the session stopped, if it failed or was aborted
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create a new in-progress session
    pub fn new(
        customer_id: impl Into<String>,
        wallet_id: impl Into<String>,
        purpose: SessionPurpose,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            customer_id: customer_id.into(),
            wallet_id: wallet_id.into(),
            purpose,
            state: SessionState::InProgress,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_owned_by(&self, customer_id: &str) -> bool {
        self.customer_id == customer_id
    }
}

/// A customer's wallet; used for ownership checks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: String,
    pub customer_id: String,
    pub created_at: DateTime<Utc>,
}

impl Wallet {
    pub fn new(id: impl Into<String>, customer_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            customer_id: customer_id.into(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip_strings() {
        for state in [
            SessionState::InProgress,
            SessionState::Completed,
            SessionState::Failed,
            SessionState::Aborted,
        ] {
            assert_eq!(state.to_string().parse::<SessionState>().unwrap(), state);
        }
        assert!("DONE".parse::<SessionState>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!SessionState::InProgress.is_terminal());
        assert!(SessionState::Completed.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(SessionState::Aborted.is_terminal());
    }
}
