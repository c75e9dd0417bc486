//! Round orchestration
//!
//! Every protocol round arrives as an independent request. All state needed
//! to resume lives in the stage row: the primitive state, the wait slots, and
//! a per-step record of what was received and sent so a retried request can
//! be answered without running the step again.

pub mod ecdsa;
pub mod eddsa;
pub mod slots;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::logging::{log_protocol_event, log_security_event};
use crate::storage::CustodyStore;
use crate::types::{PeerMessage, Session, SessionPurpose, SessionState, Stage, StageStatus};

pub use ecdsa::{consumed_rounds, EcdsaOrchestrator};
pub use eddsa::{aggregate_signature, EddsaOrchestrator};
pub use slots::WaitSlots;

/// What one step received and emitted
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Digest of the request's peer messages (see [`inbound_digest`])
    pub inbound_digest: String,
    pub outbound: Vec<PeerMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_output: Option<String>,
}

/// Structured payload of an ECDSA stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StagePayload {
    /// Primitive state after the last completed step (hex)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default)]
    pub slots: WaitSlots,
    #[serde(default)]
    pub steps: BTreeMap<u8, StepRecord>,
    /// Private terminal output, input to the next stage (hex)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_output: Option<String>,
}

impl StagePayload {
    pub fn from_stage(stage: &Stage) -> Result<Self> {
        serde_json::from_value(stage.payload.clone()).map_err(|e| {
            Error::internal(format!("corrupt {} payload for stage {}: {}", stage.stage_type, stage.id, e))
        })
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self).map_err(|e| Error::internal(e.to_string()))
    }

    /// Drop everything secret, keep the audit trail of public messages
    pub fn scrubbed(&self) -> Self {
        Self {
            state: None,
            slots: WaitSlots::new(),
            steps: self.steps.clone(),
            output: None,
            public_output: self.public_output.clone(),
        }
    }
}

/// Order-insensitive digest of a request's peer messages plus any extra input
pub fn inbound_digest(messages: &[PeerMessage], extra: Option<&str>) -> String {
    let mut sorted: Vec<&PeerMessage> = messages.iter().collect();
    sorted.sort_by_key(|m| (m.round, m.from, m.to));

    let mut hasher = Sha256::new();
    for m in sorted {
        hasher.update([m.round]);
        hasher.update(m.from.0.to_be_bytes());
        hasher.update(m.to.0.to_be_bytes());
        hasher.update((m.payload.len() as u32).to_be_bytes());
        hasher.update(m.payload.to_lowercase().as_bytes());
    }
    if let Some(extra) = extra {
        hasher.update(b"extra");
        hasher.update(extra.to_lowercase().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Open a session after checking the caller owns the wallet
pub(crate) async fn start_session(
    store: &dyn CustodyStore,
    customer_id: &str,
    wallet_id: &str,
    purpose: SessionPurpose,
) -> Result<Session> {
    let wallet = store
        .get_wallet(wallet_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("wallet {}", wallet_id)))?;

    if wallet.customer_id != customer_id {
        log_security_event(
            "wallet_ownership_denied",
            false,
            serde_json::json!({ "wallet_id": wallet_id, "customer_id": customer_id }),
            None,
        );
        return Err(Error::Unauthorized(format!(
            "wallet {} does not belong to the caller",
            wallet_id
        )));
    }

    let session = Session::new(customer_id, wallet_id, purpose);
    store.insert_session(&session).await?;

    log_protocol_event(
        "session_started",
        &session.id.to_string(),
        serde_json::json!({ "wallet_id": wallet_id, "purpose": purpose.to_string() }),
        None,
    );

    Ok(session)
}

/// Load a session and check ownership and purpose
pub(crate) async fn authorize(
    store: &dyn CustodyStore,
    session_id: Uuid,
    customer_id: &str,
    purpose: SessionPurpose,
) -> Result<Session> {
    let session = store
        .get_session(session_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("session {}", session_id)))?;

    if !session.is_owned_by(customer_id) {
        log_security_event(
            "session_ownership_denied",
            false,
            serde_json::json!({ "session_id": session_id, "customer_id": customer_id }),
            Some(&session_id.to_string()),
        );
        return Err(Error::Unauthorized(format!(
            "session {} does not belong to the caller",
            session_id
        )));
    }

    if session.purpose != purpose {
        return Err(Error::invalid(format!(
            "session {} is a {} session",
            session_id, session.purpose
        )));
    }

    Ok(session)
}

/// Reject work on a session that already reached a terminal state
pub(crate) fn ensure_in_progress(session: &Session) -> Result<()> {
    if session.state.is_terminal() {
        return Err(Error::sequence(format!(
            "session {} is {}",
            session.id, session.state
        )));
    }
    Ok(())
}

/// Mark a stage and its session FAILED after a primitive failure.
///
/// `expected` is the status the stage had when the failing step started;
/// `None` means the stage is not persisted yet.
pub(crate) async fn fail_stage(
    store: &dyn CustodyStore,
    mut stage: Stage,
    expected: Option<StageStatus>,
    diagnostic: &str,
) -> Result<()> {
    stage.status = StageStatus::Failed;
    stage.error = Some(diagnostic.to_string());

    match expected {
        Some(expected) => store.update_stage(&stage, expected).await?,
        None => store.insert_stage(&stage).await?,
    }
    store
        .finish_session(stage.session_id, SessionState::Failed, Some(diagnostic))
        .await?;

    log_protocol_event(
        "stage_failed",
        &stage.session_id.to_string(),
        serde_json::json!({ "stage": stage.stage_type.to_string() }),
        Some(("PRIMITIVE_FAILURE", diagnostic)),
    );

    Ok(())
}

/// Abort a session from any non-terminal status.
///
/// Open stages move to FAILED; every stage loses its secret material; the
/// session becomes ABORTED.
pub(crate) async fn abort_session(
    store: &dyn CustodyStore,
    session_id: Uuid,
    customer_id: &str,
    purpose: SessionPurpose,
    reason: &str,
) -> Result<Session> {
    let session = authorize(store, session_id, customer_id, purpose).await?;
    ensure_in_progress(&session)?;

    let error = format!("aborted: {}", reason);
    for stage in store.list_stages(session_id).await? {
        let expected = stage.status;
        let mut scrubbed = stage.clone();
        scrubbed.payload = scrub_payload(&stage)?;
        if !expected.is_terminal() {
            scrubbed.status = StageStatus::Failed;
            scrubbed.error = Some(error.clone());
        }
        store.update_stage(&scrubbed, expected).await?;
    }

    store
        .finish_session(session_id, SessionState::Aborted, Some(&error))
        .await?;

    log_protocol_event(
        "session_aborted",
        &session_id.to_string(),
        serde_json::json!({ "reason": reason }),
        None,
    );

    store
        .get_session(session_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("session {}", session_id)))
}

fn scrub_payload(stage: &Stage) -> Result<serde_json::Value> {
    match stage.stage_type.purpose() {
        SessionPurpose::Ecdsa => StagePayload::from_stage(stage)?.scrubbed().to_value(),
        SessionPurpose::Ed25519 => Ok(eddsa::scrub_payload(&stage.payload)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ParticipantId;

    fn msg(round: u8, from: u16, payload: &str) -> PeerMessage {
        PeerMessage {
            round,
            from: ParticipantId(from),
            to: ParticipantId(2),
            payload: payload.to_string(),
        }
    }

    #[test]
    fn test_inbound_digest_ignores_order() {
        let a = vec![msg(1, 0, "aa"), msg(1, 1, "bb")];
        let b = vec![msg(1, 1, "bb"), msg(1, 0, "aa")];
        assert_eq!(inbound_digest(&a, None), inbound_digest(&b, None));

        let c = vec![msg(1, 0, "aa"), msg(1, 1, "bc")];
        assert_ne!(inbound_digest(&a, None), inbound_digest(&c, None));
        assert_ne!(inbound_digest(&a, None), inbound_digest(&a, Some("00")));
    }

    #[test]
    fn test_scrubbed_payload_keeps_public_trail() {
        let mut payload = StagePayload {
            state: Some("aa".into()),
            output: Some("bb".into()),
            public_output: Some("cc".into()),
            ..Default::default()
        };
        payload.steps.insert(1, StepRecord::default());
        payload.slots.route(ParticipantId(2), 2, &msg(1, 0, "dd")).unwrap();

        let scrubbed = payload.scrubbed();
        assert!(scrubbed.state.is_none());
        assert!(scrubbed.output.is_none());
        assert!(scrubbed.slots.is_empty());
        assert_eq!(scrubbed.public_output.as_deref(), Some("cc"));
        assert_eq!(scrubbed.steps.len(), 1);
    }
}
