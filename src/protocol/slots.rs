//! Wait slots for peer messages
//!
//! Every message a participant receives is parked under its
//! (round, sender, receiver) key until the step that consumes that round
//! runs. A step may consume rounds produced several steps earlier, so slots
//! survive across steps and are only read, never cleared, once filled.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::primitives::InboundMessage;
use crate::types::{ParticipantId, PeerMessage};

/// Outcome of routing one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// The slot was empty and now holds the message
    Filled,
    /// The slot already held this exact payload
    Duplicate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WaitSlots(BTreeMap<String, String>);

pub fn slot_key(round: u8, from: ParticipantId, to: ParticipantId) -> String {
    format!("r{}/{}->{}", round, from, to)
}

impl WaitSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Park `message` for participant `me` while running `step`.
    ///
    /// Only rounds already produced (`round < step`) are accepted. A filled
    /// slot is never overwritten; a different payload for it is a sequence
    /// error.
    pub fn route(&mut self, me: ParticipantId, step: u8, message: &PeerMessage) -> Result<Routed> {
        if message.to != me {
            return Err(Error::invalid(format!(
                "message from {} is addressed to {}, not {}",
                message.from, message.to, me
            )));
        }
        if message.from == me {
            return Err(Error::invalid(format!("{} cannot message itself", me)));
        }
        if message.round == 0 || message.round >= step {
            return Err(Error::sequence(format!(
                "round {} message cannot be consumed at step {}",
                message.round, step
            )));
        }
        hex::decode(&message.payload)
            .map_err(|e| Error::invalid(format!("payload is not hex: {}", e)))?;

        let key = slot_key(message.round, message.from, message.to);
        match self.0.get(&key) {
            Some(existing) if *existing == message.payload => Ok(Routed::Duplicate),
            Some(_) => Err(Error::sequence(format!(
                "slot {} already holds a different message",
                key
            ))),
            None => {
                self.0.insert(key, message.payload.clone());
                Ok(Routed::Filled)
            }
        }
    }

    /// Messages for `rounds` from every peer to `me`; `IncompleteRound` names
    /// every empty slot.
    pub fn collect(
        &self,
        rounds: &[u8],
        peers: &[ParticipantId],
        me: ParticipantId,
    ) -> Result<Vec<InboundMessage>> {
        let mut inbox = Vec::new();
        let mut missing = Vec::new();

        for round in rounds {
            for peer in peers.iter().filter(|p| **p != me) {
                let key = slot_key(*round, *peer, me);
                match self.0.get(&key) {
                    Some(payload) => inbox.push(InboundMessage {
                        round: *round,
                        from: *peer,
                        payload: hex::decode(payload).map_err(|e| {
                            Error::internal(format!("corrupt slot {}: {}", key, e))
                        })?,
                    }),
                    None => missing.push(key),
                }
            }
        }

        if !missing.is_empty() {
            return Err(Error::IncompleteRound { missing });
        }
        Ok(inbox)
    }
}
