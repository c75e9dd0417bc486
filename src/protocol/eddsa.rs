//! FROST Ed25519 round orchestrator
//!
//! SIGN_ED25519 runs commit (step 1), signature share (step 2) and aggregate
//! (step 3). PRESIGN_ED25519 lets the server commit ahead of time; a later
//! commit imports those nonces instead of generating new ones and clears
//! them from the presign stage so they are used at most once.

use frost_ed25519 as frost;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::custody::CustodyCoordinator;
use crate::error::{Error, Result};
use crate::keystore::Ed25519ShareData;
use crate::logging::log_protocol_event;
use crate::primitives::PrimitiveError;
use crate::storage::CustodyStore;
use crate::types::{
    Curve, Ed25519AggregateRequest, Ed25519CommitResponse, Ed25519ShareResponse,
    Ed25519SignRequest, Ed25519SignatureResponse, IdentifiedPayload, Session, SessionPurpose,
    SessionRequest, SessionState, Stage, StageStatus, StageType,
};

use super::{abort_session, authorize, ensure_in_progress, fail_stage, start_session};

/// Payload of PRESIGN_ED25519 and SIGN_ED25519 stages
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct EddsaPayload {
    /// Server FROST identifier (hex)
    identifier: String,
    /// Server round-1 commitment (hex)
    commitment: String,
    /// Round-1 nonces (hex); cleared once used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nonces: Option<String>,
    #[serde(default)]
    presigned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signing_package: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signature_share: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    share_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    verifying_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    aggregate_digest: Option<String>,
}

impl EddsaPayload {
    fn from_stage(stage: &Stage) -> Result<Self> {
        serde_json::from_value(stage.payload.clone()).map_err(|e| {
            Error::internal(format!("corrupt {} payload for stage {}: {}", stage.stage_type, stage.id, e))
        })
    }

    fn to_value(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self).map_err(|e| Error::internal(e.to_string()))
    }
}

/// Remove unused nonces from an Ed25519 stage payload
pub(crate) fn scrub_payload(payload: &serde_json::Value) -> serde_json::Value {
    match serde_json::from_value::<EddsaPayload>(payload.clone()) {
        Ok(mut parsed) => {
            parsed.nonces = None;
            serde_json::to_value(parsed).unwrap_or(serde_json::Value::Null)
        }
        Err(_) => serde_json::Value::Null,
    }
}

fn digest_payloads(prefix: &str, items: &[IdentifiedPayload]) -> String {
    let mut sorted: Vec<&IdentifiedPayload> = items.iter().collect();
    sorted.sort_by(|a, b| a.identifier.cmp(&b.identifier));

    let mut hasher = Sha256::new();
    hasher.update(prefix.to_lowercase().as_bytes());
    for item in sorted {
        hasher.update(b"|");
        hasher.update(item.identifier.to_lowercase().as_bytes());
        hasher.update(b":");
        hasher.update(item.payload.to_lowercase().as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn decode_hex(field: &str, value: &str) -> Result<Vec<u8>> {
    hex::decode(value).map_err(|e| Error::invalid(format!("{} is not hex: {}", field, e)))
}

fn parse_identifier(value: &str) -> Result<frost::Identifier> {
    frost::Identifier::deserialize(&decode_hex("identifier", value)?)
        .map_err(|e| Error::invalid(format!("invalid identifier {}: {}", value, e)))
}

/// Combine signature shares and verify the result against the group key.
///
/// Shares are keyed by identifier in a `BTreeMap`, so the signature is the
/// same whatever order they arrive in.
pub fn aggregate_signature(
    signing_package: &frost::SigningPackage,
    shares: impl IntoIterator<Item = (frost::Identifier, frost::round2::SignatureShare)>,
    public_key_package: &frost::keys::PublicKeyPackage,
) -> std::result::Result<[u8; 64], PrimitiveError> {
    let mut signature_shares = BTreeMap::new();
    for (identifier, share) in shares {
        if signature_shares.insert(identifier, share).is_some() {
            return Err(PrimitiveError::Malformed(format!(
                "duplicate signature share for {}",
                hex::encode(identifier.serialize())
            )));
        }
    }

    let signature = frost::aggregate(signing_package, &signature_shares, public_key_package)
        .map_err(|e| PrimitiveError::Consistency(format!("aggregation failed: {}", e)))?;

    public_key_package
        .verifying_key()
        .verify(signing_package.message(), &signature)
        .map_err(|e| {
            PrimitiveError::Consistency(format!("aggregate signature does not verify: {}", e))
        })?;

    let sig_bytes = signature
        .serialize()
        .map_err(|e| PrimitiveError::Malformed(e.to_string()))?;
    sig_bytes.as_slice().try_into().map_err(|_| {
        PrimitiveError::Malformed(format!(
            "invalid signature length: expected 64, got {}",
            sig_bytes.len()
        ))
    })
}

pub struct EddsaOrchestrator {
    store: Arc<dyn CustodyStore>,
    custody: Arc<CustodyCoordinator>,
}

impl EddsaOrchestrator {
    pub fn new(store: Arc<dyn CustodyStore>, custody: Arc<CustodyCoordinator>) -> Self {
        Self { store, custody }
    }

    pub async fn start_session(&self, customer_id: &str, wallet_id: &str) -> Result<Session> {
        start_session(self.store.as_ref(), customer_id, wallet_id, SessionPurpose::Ed25519).await
    }

    pub async fn abort(&self, customer_id: &str, session_id: Uuid, reason: &str) -> Result<Session> {
        abort_session(
            self.store.as_ref(),
            session_id,
            customer_id,
            SessionPurpose::Ed25519,
            reason,
        )
        .await
    }

    async fn key_material(
        &self,
        wallet_id: &str,
    ) -> Result<(frost::keys::KeyPackage, frost::keys::PublicKeyPackage)> {
        let bytes = self.custody.load_share(wallet_id, Curve::Ed25519).await?;
        Ok(Ed25519ShareData::from_bytes(&bytes)?.packages()?)
    }

    async fn session_for(&self, session_id: Uuid, customer_id: &str) -> Result<Session> {
        authorize(self.store.as_ref(), session_id, customer_id, SessionPurpose::Ed25519).await
    }

    /// Fresh round-1 commitment as a stage payload
    fn fresh_commitment(key_package: &frost::keys::KeyPackage) -> Result<EddsaPayload> {
        let mut rng = rand::thread_rng();
        let (nonces, commitments) = frost::round1::commit(key_package.signing_share(), &mut rng);

        let commitment = commitments
            .serialize()
            .map_err(|e| Error::internal(format!("commitment serialization: {}", e)))?;
        let nonces = nonces
            .serialize()
            .map_err(|e| Error::internal(format!("nonce serialization: {}", e)))?;

        Ok(EddsaPayload {
            identifier: hex::encode(key_package.identifier().serialize()),
            commitment: hex::encode(commitment),
            nonces: Some(hex::encode(nonces)),
            ..Default::default()
        })
    }

    /// PRESIGN_ED25519: commit before the message is known
    pub async fn presign(&self, request: SessionRequest) -> Result<Ed25519CommitResponse> {
        let session = self.session_for(request.session_id, &request.customer_id).await?;

        if let Some(stage) = self
            .store
            .get_stage(session.id, StageType::PresignEd25519)
            .await?
        {
            if stage.status != StageStatus::Completed {
                return Err(Error::sequence(format!(
                    "PRESIGN_ED25519 is {}",
                    stage.status
                )));
            }
            let payload = EddsaPayload::from_stage(&stage)?;
            return Ok(Ed25519CommitResponse {
                session_id: session.id,
                identifier: payload.identifier,
                commitment: payload.commitment,
                presigned: true,
                replayed: true,
            });
        }

        ensure_in_progress(&session)?;
        if self
            .store
            .get_stage(session.id, StageType::SignEd25519)
            .await?
            .is_some()
        {
            return Err(Error::sequence("signing already committed for this session"));
        }

        let (key_package, _) = self.key_material(&session.wallet_id).await?;
        let mut payload = Self::fresh_commitment(&key_package)?;
        payload.presigned = true;

        let stage = Stage::new(
            session.id,
            StageType::PresignEd25519,
            StageStatus::after_step(1, StageType::PresignEd25519.step_count()),
            payload.to_value()?,
        );
        self.store.insert_stage(&stage).await?;

        tracing::debug!(
            target: "tss::protocol",
            session_id = %session.id,
            "Cached presign commitment"
        );

        Ok(Ed25519CommitResponse {
            session_id: session.id,
            identifier: payload.identifier,
            commitment: payload.commitment,
            presigned: true,
            replayed: false,
        })
    }

    /// SIGN_ED25519 step 1
    pub async fn commit(&self, request: SessionRequest) -> Result<Ed25519CommitResponse> {
        let session = self.session_for(request.session_id, &request.customer_id).await?;

        if let Some(stage) = self.store.get_stage(session.id, StageType::SignEd25519).await? {
            if stage.completed_steps().is_none() {
                return Err(Error::sequence(format!(
                    "SIGN_ED25519 failed: {}",
                    stage.error.as_deref().unwrap_or("unknown")
                )));
            }
            let payload = EddsaPayload::from_stage(&stage)?;
            return Ok(Ed25519CommitResponse {
                session_id: session.id,
                identifier: payload.identifier,
                commitment: payload.commitment,
                presigned: payload.presigned,
                replayed: true,
            });
        }
        ensure_in_progress(&session)?;

        let presign = self
            .store
            .get_stage(session.id, StageType::PresignEd25519)
            .await?;

        let payload = match &presign {
            Some(stage) if stage.status == StageStatus::Completed => {
                let cached = EddsaPayload::from_stage(stage)?;
                if cached.nonces.is_none() {
                    return Err(Error::sequence("presigned nonces already consumed"));
                }
                cached
            }
            Some(stage) => {
                return Err(Error::sequence(format!(
                    "PRESIGN_ED25519 is {}",
                    stage.status
                )))
            }
            None => {
                let (key_package, _) = self.key_material(&session.wallet_id).await?;
                Self::fresh_commitment(&key_package)?
            }
        };

        // The sign stage's unique (session, type) row guards the nonces:
        // only the writer that inserts it may consume them.
        let stage = Stage::new(
            session.id,
            StageType::SignEd25519,
            StageStatus::StepCompleted(1),
            payload.to_value()?,
        );
        self.store.insert_stage(&stage).await?;

        if let Some(mut presign) = presign {
            let mut cleared = payload.clone();
            cleared.nonces = None;
            presign.payload = cleared.to_value()?;
            self.store
                .update_stage(&presign, StageStatus::Completed)
                .await?;
        }

        tracing::debug!(
            target: "tss::protocol",
            session_id = %session.id,
            presigned = payload.presigned,
            "Server commitment ready"
        );

        Ok(Ed25519CommitResponse {
            session_id: session.id,
            identifier: payload.identifier,
            commitment: payload.commitment,
            presigned: payload.presigned,
            replayed: false,
        })
    }

    /// SIGN_ED25519 step 2: all commitments plus the message in, server share out
    pub async fn sign_share(&self, request: Ed25519SignRequest) -> Result<Ed25519ShareResponse> {
        let session = self.session_for(request.session_id, &request.customer_id).await?;
        let stage = self
            .store
            .get_stage(session.id, StageType::SignEd25519)
            .await?
            .ok_or_else(|| Error::sequence("SIGN_ED25519 not started, expected step 1"))?;
        let mut payload = EddsaPayload::from_stage(&stage)?;
        let digest = digest_payloads(&request.message, &request.commitments);

        match stage.completed_steps() {
            None => {
                return Err(Error::sequence(format!(
                    "SIGN_ED25519 failed: {}",
                    stage.error.as_deref().unwrap_or("unknown")
                )))
            }
            Some(done) if done >= 2 => {
                if payload.share_digest.as_deref() != Some(digest.as_str()) {
                    return Err(Error::sequence(
                        "SIGN_ED25519 step 2 already ran with different input",
                    ));
                }
                return Ok(Ed25519ShareResponse {
                    session_id: session.id,
                    identifier: payload.identifier,
                    signature_share: payload.signature_share.unwrap_or_default(),
                    replayed: true,
                });
            }
            Some(_) => {}
        }
        ensure_in_progress(&session)?;

        let message = decode_hex("message", &request.message)?;
        let (key_package, _) = self.key_material(&session.wallet_id).await?;
        let own_identifier = *key_package.identifier();

        let mut commitments: BTreeMap<frost::Identifier, frost::round1::SigningCommitments> =
            BTreeMap::new();
        for item in &request.commitments {
            let identifier = parse_identifier(&item.identifier)?;
            if identifier == own_identifier {
                return Err(Error::invalid("client commitment uses the server identifier"));
            }
            let commitment = frost::round1::SigningCommitments::deserialize(&decode_hex(
                "commitment",
                &item.payload,
            )?)
            .map_err(|e| Error::invalid(format!("invalid commitment: {}", e)))?;
            if commitments.insert(identifier, commitment).is_some() {
                return Err(Error::invalid(format!(
                    "duplicate commitment for {}",
                    item.identifier
                )));
            }
        }

        let own_commitment = frost::round1::SigningCommitments::deserialize(&decode_hex(
            "commitment",
            &payload.commitment,
        )?)
        .map_err(|e| Error::internal(format!("stored commitment: {}", e)))?;
        commitments.insert(own_identifier, own_commitment);

        if commitments.len() < *key_package.min_signers() as usize {
            return Err(Error::invalid(format!(
                "need {} commitments, got {}",
                key_package.min_signers(),
                commitments.len()
            )));
        }

        let nonces_hex = payload
            .nonces
            .take()
            .ok_or_else(|| Error::internal("server nonces missing"))?;
        let nonces = frost::round1::SigningNonces::deserialize(&decode_hex("nonces", &nonces_hex)?)
            .map_err(|e| Error::internal(format!("stored nonces: {}", e)))?;

        let signing_package = frost::SigningPackage::new(commitments, &message);
        let share = match frost::round2::sign(&signing_package, &nonces, &key_package) {
            Ok(share) => share,
            Err(e) => {
                let diagnostic = format!("signature share failed: {}", e);
                let mut failed = stage;
                failed.payload = payload.to_value()?;
                fail_stage(
                    self.store.as_ref(),
                    failed,
                    Some(StageStatus::StepCompleted(1)),
                    &diagnostic,
                )
                .await?;
                return Err(Error::Primitive(diagnostic));
            }
        };

        let package_bytes = signing_package
            .serialize()
            .map_err(|e| Error::internal(format!("signing package serialization: {}", e)))?;

        payload.message = Some(hex::encode(&message));
        payload.signing_package = Some(hex::encode(package_bytes));
        payload.signature_share = Some(hex::encode(share.serialize()));
        payload.share_digest = Some(digest);

        let mut updated = stage;
        updated.status = StageStatus::StepCompleted(2);
        updated.payload = payload.to_value()?;
        self.store
            .update_stage(&updated, StageStatus::StepCompleted(1))
            .await?;

        Ok(Ed25519ShareResponse {
            session_id: session.id,
            identifier: payload.identifier,
            signature_share: payload.signature_share.unwrap_or_default(),
            replayed: false,
        })
    }

    /// SIGN_ED25519 step 3: client shares in, verified signature out
    pub async fn aggregate(
        &self,
        request: Ed25519AggregateRequest,
    ) -> Result<Ed25519SignatureResponse> {
        let session = self.session_for(request.session_id, &request.customer_id).await?;
        let stage = self
            .store
            .get_stage(session.id, StageType::SignEd25519)
            .await?
            .ok_or_else(|| Error::sequence("SIGN_ED25519 not started, expected step 1"))?;
        let mut payload = EddsaPayload::from_stage(&stage)?;
        let digest = digest_payloads("aggregate", &request.signature_shares);

        match stage.completed_steps() {
            None => {
                return Err(Error::sequence(format!(
                    "SIGN_ED25519 failed: {}",
                    stage.error.as_deref().unwrap_or("unknown")
                )))
            }
            Some(3) => {
                if payload.aggregate_digest.as_deref() != Some(digest.as_str()) {
                    return Err(Error::sequence(
                        "SIGN_ED25519 step 3 already ran with different input",
                    ));
                }
                return Ok(Ed25519SignatureResponse {
                    session_id: session.id,
                    signature: payload.signature.unwrap_or_default(),
                    verifying_key: payload.verifying_key.unwrap_or_default(),
                    replayed: true,
                });
            }
            Some(2) => {}
            Some(done) => {
                return Err(Error::sequence(format!(
                    "SIGN_ED25519 is at {}, expected step {}",
                    stage.status,
                    done + 1
                )))
            }
        }
        ensure_in_progress(&session)?;

        let (_, public_key_package) = self.key_material(&session.wallet_id).await?;
        let signing_package = frost::SigningPackage::deserialize(&decode_hex(
            "signing_package",
            payload.signing_package.as_deref().unwrap_or_default(),
        )?)
        .map_err(|e| Error::internal(format!("stored signing package: {}", e)))?;

        let own_identifier = parse_identifier(&payload.identifier)?;
        let mut seen = BTreeSet::new();
        let mut shares = Vec::with_capacity(request.signature_shares.len() + 1);
        for item in &request.signature_shares {
            let identifier = parse_identifier(&item.identifier)?;
            if identifier == own_identifier {
                return Err(Error::invalid("client signature share uses the server identifier"));
            }
            if !seen.insert(identifier) {
                return Err(Error::invalid(format!(
                    "duplicate signature share for {}",
                    item.identifier
                )));
            }
            let share = frost::round2::SignatureShare::deserialize(&decode_hex(
                "signature_share",
                &item.payload,
            )?)
            .map_err(|e| Error::invalid(format!("invalid signature share: {}", e)))?;
            shares.push((identifier, share));
        }
        let own_share = frost::round2::SignatureShare::deserialize(&decode_hex(
            "signature_share",
            payload.signature_share.as_deref().unwrap_or_default(),
        )?)
        .map_err(|e| Error::internal(format!("stored signature share: {}", e)))?;
        shares.push((own_identifier, own_share));

        let signature = match aggregate_signature(&signing_package, shares, &public_key_package) {
            Ok(signature) => signature,
            Err(e) => {
                let diagnostic = e.to_string();
                let mut failed = stage;
                failed.payload = payload.to_value()?;
                fail_stage(
                    self.store.as_ref(),
                    failed,
                    Some(StageStatus::StepCompleted(2)),
                    &diagnostic,
                )
                .await?;
                return Err(Error::Primitive(diagnostic));
            }
        };

        let verifying_key = public_key_package
            .verifying_key()
            .serialize()
            .map_err(|e| Error::internal(format!("verifying key serialization: {}", e)))?;

        payload.signature = Some(hex::encode(signature));
        payload.verifying_key = Some(hex::encode(verifying_key));
        payload.aggregate_digest = Some(digest);

        let mut updated = stage;
        updated.status = StageStatus::Completed;
        updated.payload = payload.to_value()?;
        self.store
            .update_stage(&updated, StageStatus::StepCompleted(2))
            .await?;
        self.store
            .finish_session(session.id, SessionState::Completed, None)
            .await?;

        log_protocol_event(
            "stage_completed",
            &session.id.to_string(),
            serde_json::json!({ "stage": StageType::SignEd25519.to_string() }),
            None,
        );

        Ok(Ed25519SignatureResponse {
            session_id: session.id,
            signature: payload.signature.unwrap_or_default(),
            verifying_key: payload.verifying_key.unwrap_or_default(),
            replayed: false,
        })
    }
}
