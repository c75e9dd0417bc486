//! Deterministic hash-based stand-in for the ECDSA primitive library
//!
//! Mirrors the message pattern of the real protocols (every participant
//! broadcasts a contribution in round 1 and an echo of the full contribution
//! set in every later round) with SHA-256 in place of curve arithmetic. Used
//! by tests, local development and the client-side participants in the
//! integration harness. It performs the same cross-participant checks the
//! real library does: echoes must agree and, when signing, every
//! participant must hold the same big R.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::{
    EcdsaPrimitives, EcdsaProtocol, OutboundMessage, PresignSeed, PrimitiveError, SignSeed,
    StepInput, StepOutput,
};
use crate::types::ParticipantId;

#[derive(Debug, Default, Clone, Copy)]
pub struct SimulatedEcdsa;

impl SimulatedEcdsa {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SimState {
    protocol: EcdsaProtocol,
    me: u16,
    step: u8,
    secret: String,
    /// Round-1 contributions keyed by participant, own included
    contributions: BTreeMap<u16, String>,
    #[serde(default)]
    big_r: Option<String>,
    #[serde(default)]
    message_hash: Option<String>,
}

/// SHA-256 over length-prefixed parts
fn digest(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u32).to_be_bytes());
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn malformed(e: impl std::fmt::Display) -> PrimitiveError {
    PrimitiveError::Malformed(e.to_string())
}

impl SimState {
    fn encode(&self) -> Result<Vec<u8>, PrimitiveError> {
        serde_json::to_vec(self).map_err(malformed)
    }

    fn decode(bytes: &[u8]) -> Result<Self, PrimitiveError> {
        serde_json::from_slice(bytes).map_err(malformed)
    }

    fn protocol_tag(&self) -> Vec<u8> {
        self.protocol.to_string().into_bytes()
    }

    /// Hash of every contribution in participant order
    fn transcript(&self, label: &[u8], round: u8) -> Result<[u8; 32], PrimitiveError> {
        let mut hasher = Sha256::new();
        hasher.update(label);
        hasher.update(self.protocol_tag());
        hasher.update([round]);
        for (id, contribution) in &self.contributions {
            hasher.update(id.to_be_bytes());
            hasher.update(hex::decode(contribution).map_err(malformed)?);
        }
        Ok(hasher.finalize().into())
    }

    fn require_all(&self, participants: &[ParticipantId]) -> Result<(), PrimitiveError> {
        for p in participants {
            if !self.contributions.contains_key(&p.0) {
                return Err(PrimitiveError::Abort(format!(
                    "missing round 1 contribution from {}",
                    p
                )));
            }
        }
        Ok(())
    }
}

impl SimulatedEcdsa {
    fn first_step(&self, input: &StepInput) -> Result<(SimState, Vec<u8>), PrimitiveError> {
        let mut secret = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut secret);

        let mut state = SimState {
            protocol: input.protocol,
            me: input.me.0,
            step: 1,
            secret: hex::encode(secret),
            contributions: BTreeMap::new(),
            big_r: None,
            message_hash: None,
        };

        let payload = match input.protocol {
            EcdsaProtocol::Triples => {
                digest(&[b"contribution", &state.protocol_tag(), &secret]).to_vec()
            }
            EcdsaProtocol::Presign => {
                let seed = input
                    .seed
                    .as_deref()
                    .ok_or_else(|| PrimitiveError::Malformed("presign requires a seed".into()))?;
                let seed: PresignSeed = serde_json::from_slice(seed).map_err(malformed)?;
                digest(&[
                    b"contribution",
                    &state.protocol_tag(),
                    &secret,
                    seed.triple_output.as_bytes(),
                    seed.key_share.as_bytes(),
                ])
                .to_vec()
            }
            EcdsaProtocol::Sign => {
                let seed = input
                    .seed
                    .as_deref()
                    .ok_or_else(|| PrimitiveError::Malformed("sign requires a seed".into()))?;
                let seed: SignSeed = serde_json::from_slice(seed).map_err(malformed)?;
                let presign = hex::decode(&seed.presign_output).map_err(malformed)?;
                let message_hash = hex::decode(&seed.message_hash).map_err(malformed)?;
                if presign.len() < 64 {
                    return Err(PrimitiveError::Malformed(
                        "presign output too short".into(),
                    ));
                }
                if message_hash.len() != 32 {
                    return Err(PrimitiveError::Malformed(
                        "message hash must be 32 bytes".into(),
                    ));
                }
                let big_r = &presign[..32];
                let share = digest(&[b"sig-share", &presign, &message_hash]);
                state.big_r = Some(hex::encode(big_r));
                state.message_hash = Some(seed.message_hash);
                [big_r, &share[..]].concat()
            }
        };

        state.contributions.insert(input.me.0, hex::encode(&payload));
        Ok((state, payload))
    }

    fn absorb(
        &self,
        state: &mut SimState,
        input: &StepInput,
    ) -> Result<(), PrimitiveError> {
        for message in &input.inbox {
            if message.round == 1 {
                if state.protocol == EcdsaProtocol::Sign {
                    let own = state.big_r.as_deref().unwrap_or_default();
                    let theirs = message.payload.get(..32).map(hex::encode).unwrap_or_default();
                    if own != theirs {
                        return Err(PrimitiveError::Consistency(format!(
                            "big_r mismatch with {}",
                            message.from
                        )));
                    }
                }
                state
                    .contributions
                    .insert(message.from.0, hex::encode(&message.payload));
            } else {
                let expected = state.transcript(b"echo", message.round)?;
                if message.payload != expected {
                    return Err(PrimitiveError::Consistency(format!(
                        "round {} echo from {} does not match",
                        message.round, message.from
                    )));
                }
            }
        }
        Ok(())
    }

    fn finish(
        &self,
        state: &SimState,
        participants: &[ParticipantId],
    ) -> Result<(Vec<u8>, Vec<u8>), PrimitiveError> {
        state.require_all(participants)?;
        let secret = hex::decode(&state.secret).map_err(malformed)?;

        match state.protocol {
            EcdsaProtocol::Triples => {
                let public = state.transcript(b"triple-public", 0)?;
                let private = digest(&[b"triple-share", &secret, &public]);
                Ok(([public, private].concat(), public.to_vec()))
            }
            EcdsaProtocol::Presign => {
                // Private output leads with big R so signing can check it
                let big_r = state.transcript(b"big-r", 0)?;
                let k_share = digest(&[b"k-share", &secret, &big_r]);
                Ok(([big_r, k_share].concat(), big_r.to_vec()))
            }
            EcdsaProtocol::Sign => {
                let big_r = hex::decode(state.big_r.as_deref().unwrap_or_default())
                    .map_err(malformed)?;
                let message_hash = hex::decode(state.message_hash.as_deref().unwrap_or_default())
                    .map_err(malformed)?;
                let s = digest(&[
                    b"signature",
                    &message_hash,
                    &state.transcript(b"shares", 0)?,
                ]);
                let signature = [big_r.as_slice(), &s[..]].concat();
                Ok((signature.clone(), signature))
            }
        }
    }
}

impl EcdsaPrimitives for SimulatedEcdsa {
    fn step(&self, input: StepInput) -> Result<StepOutput, PrimitiveError> {
        let total = input.protocol.step_count();
        if input.step == 0 || input.step > total {
            return Err(PrimitiveError::Malformed(format!(
                "step {} outside 1..={}",
                input.step, total
            )));
        }

        let mut state = match (&input.state, input.step) {
            (None, 1) => {
                let (state, payload) = self.first_step(&input)?;
                let outbox = input
                    .participants
                    .iter()
                    .filter(|p| **p != input.me)
                    .map(|p| OutboundMessage {
                        round: 1,
                        to: *p,
                        payload: payload.clone(),
                    })
                    .collect();
                return Ok(StepOutput {
                    state: state.encode()?,
                    outbox,
                    output: None,
                    public_output: None,
                });
            }
            (Some(bytes), step) if step > 1 => SimState::decode(bytes)?,
            _ => {
                return Err(PrimitiveError::Malformed(
                    "state must be absent exactly on step 1".into(),
                ))
            }
        };

        if state.step + 1 != input.step || state.me != input.me.0 || state.protocol != input.protocol
        {
            return Err(PrimitiveError::Malformed(format!(
                "state is for {} step {} of {}, not {} step {}",
                state.protocol,
                state.step,
                ParticipantId(state.me),
                input.protocol,
                input.step
            )));
        }

        self.absorb(&mut state, &input)?;
        state.step = input.step;

        if input.step == total {
            let (output, public_output) = self.finish(&state, &input.participants)?;
            return Ok(StepOutput {
                state: state.encode()?,
                outbox: Vec::new(),
                output: Some(output),
                public_output: Some(public_output),
            });
        }

        state.require_all(&input.participants)?;
        let echo = state.transcript(b"echo", input.step)?.to_vec();
        let outbox = input
            .participants
            .iter()
            .filter(|p| **p != input.me)
            .map(|p| OutboundMessage {
                round: input.step,
                to: *p,
                payload: echo.clone(),
            })
            .collect();

        Ok(StepOutput {
            state: state.encode()?,
            outbox,
            output: None,
            public_output: None,
        })
    }
}
