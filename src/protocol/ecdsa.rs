//! Threshold ECDSA round orchestrator
//!
//! Sequences the triples (11 steps), presign (3 steps) and sign (2 steps)
//! protocols between the client-held participants and the server participant.
//! A step is accepted only when the stage is at `STEP_{n-1}_COMPLETED`;
//! requests for an already-completed step are answered from the stored
//! step record.

use std::sync::Arc;

use crate::custody::CustodyCoordinator;
use crate::error::{Error, Result};
use crate::logging::log_protocol_event;
use crate::primitives::{
    EcdsaPrimitives, EcdsaProtocol, PresignSeed, SignSeed, StepInput,
};
use crate::storage::CustodyStore;
use crate::types::{
    Curve, ParticipantId, PeerMessage, RoundRequest, RoundResponse, Session, SessionPurpose,
    SessionState, Stage, StageStatus, StageType,
};

use super::{
    abort_session, authorize, ensure_in_progress, fail_stage, inbound_digest, start_session,
    StagePayload, StepRecord,
};

/// Rounds each step consumes, indexed by step - 1.
///
/// A round's messages are produced by the step with the same number. Some
/// triple steps consume a round produced two steps earlier.
const TRIPLES_SCHEDULE: [&[u8]; 11] = [
    &[],
    &[1],
    &[2],
    &[3],
    &[2, 4],
    &[5],
    &[6],
    &[7],
    &[8],
    &[6, 9],
    &[10],
];
const PRESIGN_SCHEDULE: [&[u8]; 3] = [&[], &[1], &[2]];
const SIGN_SCHEDULE: [&[u8]; 2] = [&[], &[1]];

/// Rounds whose messages `step` of `protocol` needs in its wait slots
pub fn consumed_rounds(protocol: EcdsaProtocol, step: u8) -> &'static [u8] {
    let schedule: &[&'static [u8]] = match protocol {
        EcdsaProtocol::Triples => &TRIPLES_SCHEDULE,
        EcdsaProtocol::Presign => &PRESIGN_SCHEDULE,
        EcdsaProtocol::Sign => &SIGN_SCHEDULE,
    };
    step.checked_sub(1)
        .and_then(|i| schedule.get(i as usize))
        .copied()
        .unwrap_or(&[])
}

pub struct EcdsaOrchestrator {
    store: Arc<dyn CustodyStore>,
    custody: Arc<CustodyCoordinator>,
    primitive: Arc<dyn EcdsaPrimitives>,
    me: ParticipantId,
    participants: Vec<ParticipantId>,
}

impl EcdsaOrchestrator {
    pub fn new(
        store: Arc<dyn CustodyStore>,
        custody: Arc<CustodyCoordinator>,
        primitive: Arc<dyn EcdsaPrimitives>,
        me: ParticipantId,
        peers: &[ParticipantId],
    ) -> Self {
        let mut participants: Vec<ParticipantId> = peers.to_vec();
        participants.push(me);
        participants.sort();
        participants.dedup();

        Self {
            store,
            custody,
            primitive,
            me,
            participants,
        }
    }

    pub fn participant_id(&self) -> ParticipantId {
        self.me
    }

    pub fn participants(&self) -> &[ParticipantId] {
        &self.participants
    }

    pub async fn start_session(&self, customer_id: &str, wallet_id: &str) -> Result<Session> {
        start_session(self.store.as_ref(), customer_id, wallet_id, SessionPurpose::Ecdsa).await
    }

    pub async fn triples(&self, request: RoundRequest) -> Result<RoundResponse> {
        self.run_step(EcdsaProtocol::Triples, request).await
    }

    pub async fn presign(&self, request: RoundRequest) -> Result<RoundResponse> {
        self.run_step(EcdsaProtocol::Presign, request).await
    }

    pub async fn sign(&self, request: RoundRequest) -> Result<RoundResponse> {
        self.run_step(EcdsaProtocol::Sign, request).await
    }

    pub async fn abort(&self, customer_id: &str, session_id: uuid::Uuid, reason: &str) -> Result<Session> {
        abort_session(
            self.store.as_ref(),
            session_id,
            customer_id,
            SessionPurpose::Ecdsa,
            reason,
        )
        .await
    }

    async fn run_step(&self, protocol: EcdsaProtocol, request: RoundRequest) -> Result<RoundResponse> {
        let stage_type = protocol.stage_type();
        let total = protocol.step_count();
        if request.step == 0 || request.step > total {
            return Err(Error::sequence(format!(
                "{} has steps 1..={}, got {}",
                stage_type, total, request.step
            )));
        }

        let session = authorize(
            self.store.as_ref(),
            request.session_id,
            &request.customer_id,
            SessionPurpose::Ecdsa,
        )
        .await?;
        let existing = self.store.get_stage(session.id, stage_type).await?;
        let digest = inbound_digest(&request.messages, request.message_hash.as_deref());

        if let Some(stage) = &existing {
            match stage.completed_steps() {
                None => {
                    return Err(Error::sequence(format!(
                        "{} stage failed: {}",
                        stage_type,
                        stage.error.as_deref().unwrap_or("unknown")
                    )))
                }
                Some(done) if request.step <= done => {
                    return self.replay(stage, request.step, &digest);
                }
                Some(done) if request.step != done + 1 => {
                    return Err(Error::sequence(format!(
                        "{} is at {}, expected step {}",
                        stage_type,
                        stage.status,
                        done + 1
                    )));
                }
                Some(_) => {}
            }
        } else if request.step != 1 {
            return Err(Error::sequence(format!(
                "{} not started, expected step 1",
                stage_type
            )));
        }
        ensure_in_progress(&session)?;

        let seed = if request.step == 1 {
            self.seed_for(protocol, &session, request.message_hash.as_deref())
                .await?
        } else {
            None
        };

        let mut payload = match &existing {
            Some(stage) => StagePayload::from_stage(stage)?,
            None => StagePayload::default(),
        };

        // Route and collect before touching the store; an incomplete round
        // leaves the stage exactly as it was.
        for message in &request.messages {
            payload.slots.route(self.me, request.step, message)?;
        }
        let inbox = payload
            .slots
            .collect(consumed_rounds(protocol, request.step), &self.participants, self.me)?;
        let state = payload
            .state
            .as_deref()
            .map(hex::decode)
            .transpose()
            .map_err(|e| Error::internal(format!("corrupt primitive state: {}", e)))?;

        let expected = existing.as_ref().map(|s| s.status);
        let stage = existing.unwrap_or_else(|| {
            Stage::new(
                session.id,
                stage_type,
                StageStatus::StepCompleted(1),
                serde_json::Value::Null,
            )
        });

        let output = match self.primitive.step(StepInput {
            protocol,
            step: request.step,
            me: self.me,
            participants: self.participants.clone(),
            state,
            inbox,
            seed,
        }) {
            Ok(output) => output,
            Err(e) => {
                let diagnostic = e.to_string();
                let mut failed = stage;
                failed.payload = payload.scrubbed().to_value()?;
                fail_stage(self.store.as_ref(), failed, expected, &diagnostic).await?;
                return Err(Error::Primitive(diagnostic));
            }
        };

        let outbound: Vec<PeerMessage> = output
            .outbox
            .into_iter()
            .map(|m| PeerMessage {
                round: m.round,
                from: self.me,
                to: m.to,
                payload: hex::encode(m.payload),
            })
            .collect();
        let public_output = output.public_output.map(hex::encode);
        let status = StageStatus::after_step(request.step, total);

        payload.state = if status == StageStatus::Completed {
            None
        } else {
            Some(hex::encode(&output.state))
        };
        if let Some(private) = output.output {
            payload.output = Some(hex::encode(private));
        }
        payload.public_output = public_output.clone().or(payload.public_output);
        payload.steps.insert(
            request.step,
            StepRecord {
                inbound_digest: digest,
                outbound: outbound.clone(),
                public_output: public_output.clone(),
            },
        );

        let mut stage = stage;
        stage.status = status;
        stage.payload = payload.to_value()?;
        match expected {
            Some(expected) => self.store.update_stage(&stage, expected).await?,
            None => self.store.insert_stage(&stage).await?,
        }

        tracing::debug!(
            target: "tss::protocol",
            session_id = %session.id,
            stage = %stage_type,
            step = request.step,
            status = %status,
            "Step completed"
        );

        if status == StageStatus::Completed {
            if stage_type.completes_session() {
                self.store
                    .finish_session(session.id, SessionState::Completed, None)
                    .await?;
            }
            log_protocol_event(
                "stage_completed",
                &session.id.to_string(),
                serde_json::json!({ "stage": stage_type.to_string() }),
                None,
            );
        }

        Ok(RoundResponse {
            session_id: session.id,
            stage: stage_type,
            step: request.step,
            status,
            messages: outbound,
            output: public_output,
            replayed: false,
        })
    }

    /// Answer a retried step from its stored record
    fn replay(&self, stage: &Stage, step: u8, digest: &str) -> Result<RoundResponse> {
        let payload = StagePayload::from_stage(stage)?;
        let record = payload.steps.get(&step).ok_or_else(|| {
            Error::internal(format!("{} step {} has no record", stage.stage_type, step))
        })?;

        if record.inbound_digest != digest {
            return Err(Error::sequence(format!(
                "{} step {} already ran with different messages",
                stage.stage_type, step
            )));
        }

        tracing::debug!(
            target: "tss::protocol",
            session_id = %stage.session_id,
            stage = %stage.stage_type,
            step,
            "Replaying completed step"
        );

        Ok(RoundResponse {
            session_id: stage.session_id,
            stage: stage.stage_type,
            step,
            status: StageStatus::after_step(step, stage.step_count()),
            messages: record.outbound.clone(),
            output: record.public_output.clone(),
            replayed: true,
        })
    }

    /// Step-1 input: the previous stage's private output plus what this
    /// protocol needs on top of it
    async fn seed_for(
        &self,
        protocol: EcdsaProtocol,
        session: &Session,
        message_hash: Option<&str>,
    ) -> Result<Option<Vec<u8>>> {
        match protocol {
            EcdsaProtocol::Triples => Ok(None),
            EcdsaProtocol::Presign => {
                let triple_output = self.prior_output(session, StageType::Triples).await?;
                let share = self
                    .custody
                    .load_share(&session.wallet_id, Curve::Secp256k1)
                    .await?;
                let seed = PresignSeed {
                    triple_output,
                    key_share: hex::encode(share),
                };
                Ok(Some(
                    seed.to_bytes().map_err(|e| Error::internal(e.to_string()))?,
                ))
            }
            EcdsaProtocol::Sign => {
                let message_hash = message_hash
                    .ok_or_else(|| Error::invalid("sign step 1 requires message_hash"))?;
                let bytes = hex::decode(message_hash)
                    .map_err(|e| Error::invalid(format!("message_hash is not hex: {}", e)))?;
                if bytes.len() != 32 {
                    return Err(Error::invalid(format!(
                        "message_hash must be 32 bytes, got {}",
                        bytes.len()
                    )));
                }
                let presign_output = self.prior_output(session, StageType::Presign).await?;
                let seed = SignSeed {
                    presign_output,
                    message_hash: hex::encode(bytes),
                };
                Ok(Some(
                    seed.to_bytes().map_err(|e| Error::internal(e.to_string()))?,
                ))
            }
        }
    }

    async fn prior_output(&self, session: &Session, stage_type: StageType) -> Result<String> {
        let stage = self
            .store
            .get_stage(session.id, stage_type)
            .await?
            .filter(|s| s.status == StageStatus::Completed)
            .ok_or_else(|| {
                Error::sequence(format!("{} must be COMPLETED first", stage_type))
            })?;

        StagePayload::from_stage(&stage)?
            .output
            .ok_or_else(|| Error::internal(format!("{} output missing", stage_type)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_shapes() {
        assert!(consumed_rounds(EcdsaProtocol::Triples, 1).is_empty());
        assert_eq!(consumed_rounds(EcdsaProtocol::Triples, 5), &[2, 4]);
        assert_eq!(consumed_rounds(EcdsaProtocol::Triples, 10), &[6, 9]);
        assert_eq!(consumed_rounds(EcdsaProtocol::Triples, 11), &[10]);
        assert_eq!(consumed_rounds(EcdsaProtocol::Presign, 3), &[2]);
        assert_eq!(consumed_rounds(EcdsaProtocol::Sign, 2), &[1]);
        assert!(consumed_rounds(EcdsaProtocol::Sign, 3).is_empty());
    }

    #[test]
    fn test_every_consumed_round_was_produced_earlier() {
        for protocol in [EcdsaProtocol::Triples, EcdsaProtocol::Presign, EcdsaProtocol::Sign] {
            for step in 1..=protocol.step_count() {
                for round in consumed_rounds(protocol, step) {
                    assert!(*round >= 1 && *round < step, "{} step {}", protocol, step);
                }
            }
        }
    }
}
