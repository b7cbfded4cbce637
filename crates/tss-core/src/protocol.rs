//! Round-based protocol contract driven by the engine
//!
//! A [`RoundProtocol`] is a synchronous state machine: it emits its first
//! messages on `start`, consumes peer messages one at a time and eventually
//! reports its output. The engine owns all networking, timing and blame.

use serde::{de::DeserializeOwned, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// One round of a protocol schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundInfo {
    pub round_type: &'static str,
    pub is_broadcast: bool,
}

impl RoundInfo {
    pub const fn broadcast(round_type: &'static str) -> Self {
        Self {
            round_type,
            is_broadcast: true,
        }
    }

    pub const fn unicast(round_type: &'static str) -> Self {
        Self {
            round_type,
            is_broadcast: false,
        }
    }
}

/// Look up a round of `rounds` by its type tag
pub fn find_round(rounds: &'static [RoundInfo], round_type: &str) -> Option<&'static RoundInfo> {
    rounds.iter().find(|r| r.round_type == round_type)
}

/// Closest unicast round scheduled before `round_type`
pub fn previous_unicast(rounds: &'static [RoundInfo], round_type: &str) -> Option<&'static str> {
    let position = rounds.iter().position(|r| r.round_type == round_type)?;
    rounds[..position]
        .iter()
        .rev()
        .find(|r| !r.is_broadcast)
        .map(|r| r.round_type)
}

/// Destination of a protocol message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Broadcast,
    /// Party with this Shamir index
    Party(usize),
}

/// Message emitted by a protocol
#[derive(Debug, Clone)]
pub struct ProtocolMessage {
    pub round_type: &'static str,
    pub recipient: Recipient,
    pub payload: Vec<u8>,
}

impl ProtocolMessage {
    pub fn broadcast<T: Serialize>(round_type: &'static str, body: &T) -> Result<Self, ProtocolError> {
        Ok(Self {
            round_type,
            recipient: Recipient::Broadcast,
            payload: encode(body)?,
        })
    }

    pub fn unicast<T: Serialize>(
        round_type: &'static str,
        to: usize,
        body: &T,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            round_type,
            recipient: Recipient::Party(to),
            payload: encode(body)?,
        })
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient == Recipient::Broadcast
    }
}

/// Result of feeding one message to a protocol
#[derive(Debug)]
pub enum Step<O> {
    Continue(Vec<ProtocolMessage>),
    Finished(Vec<ProtocolMessage>, O),
}

/// Failures reported by a protocol
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    /// Contributions of `culprits` (Shamir indices) failed verification
    #[error("invalid contribution in {round} from parties {culprits:?}: {reason}")]
    InvalidShare {
        round: &'static str,
        culprits: Vec<usize>,
        reason: String,
    },
    /// The combined output did not verify and no single party is at fault
    #[error("output failed verification: {0}")]
    VerificationFailed(String),
    #[error("internal protocol error: {0}")]
    Internal(String),
}

impl ProtocolError {
    pub fn invalid(round: &'static str, culprit: usize, reason: impl Into<String>) -> Self {
        ProtocolError::InvalidShare {
            round,
            culprits: vec![culprit],
            reason: reason.into(),
        }
    }
}

/// Synchronous multi-party state machine
pub trait RoundProtocol: Send + 'static {
    type Output: Send + 'static;

    /// Round schedule, in execution order
    fn rounds(&self) -> &'static [RoundInfo];

    /// Messages of the first round
    fn start(&mut self) -> Result<Vec<ProtocolMessage>, ProtocolError>;

    /// Consume one peer message
    fn handle_message(
        &mut self,
        from: usize,
        round_type: &str,
        payload: &[u8],
    ) -> Result<Step<Self::Output>, ProtocolError>;
}

/// Buffers peer payloads per round until every expected sender delivered.
///
/// Messages for later rounds are kept until the protocol gets there, so peers
/// running ahead never lose data.
#[derive(Debug)]
pub struct RoundInbox {
    rounds: &'static [RoundInfo],
    expected: Vec<usize>,
    received: HashMap<&'static str, BTreeMap<usize, Vec<u8>>>,
}

impl RoundInbox {
    pub fn new(rounds: &'static [RoundInfo], expected: Vec<usize>) -> Self {
        Self {
            rounds,
            expected,
            received: HashMap::new(),
        }
    }

    /// Store a payload; duplicates keep the first copy
    pub fn insert(&mut self, from: usize, round_type: &str, payload: &[u8]) -> Result<(), ProtocolError> {
        let round = find_round(self.rounds, round_type).ok_or_else(|| {
            ProtocolError::Internal(format!("unknown round {round_type} from party {from}"))
        })?;
        if !self.expected.contains(&from) {
            return Err(ProtocolError::Internal(format!("unexpected sender {from}")));
        }
        self.received
            .entry(round.round_type)
            .or_default()
            .entry(from)
            .or_insert_with(|| payload.to_vec());
        Ok(())
    }

    pub fn is_complete(&self, round_type: &str) -> bool {
        self.received
            .get(round_type)
            .map(|got| self.expected.iter().all(|p| got.contains_key(p)))
            .unwrap_or(self.expected.is_empty())
    }

    /// Remove and return the payloads of a round
    pub fn take(&mut self, round_type: &str) -> BTreeMap<usize, Vec<u8>> {
        self.received.remove(round_type).unwrap_or_default()
    }
}

pub(crate) fn encode<T: Serialize>(body: &T) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(body).map_err(|e| ProtocolError::Internal(e.to_string()))
}

/// Decode a peer payload, blaming the sender when it is malformed
pub(crate) fn decode<T: DeserializeOwned>(
    round: &'static str,
    from: usize,
    payload: &[u8],
) -> Result<T, ProtocolError> {
    serde_json::from_slice(payload)
        .map_err(|e| ProtocolError::invalid(round, from, format!("malformed payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUNDS: &[RoundInfo] = &[
        RoundInfo::broadcast("R1"),
        RoundInfo::unicast("R2"),
        RoundInfo::broadcast("R3"),
        RoundInfo::broadcast("R4"),
    ];

    #[test]
    fn test_previous_unicast() {
        assert_eq!(previous_unicast(ROUNDS, "R1"), None);
        assert_eq!(previous_unicast(ROUNDS, "R2"), None);
        assert_eq!(previous_unicast(ROUNDS, "R4"), Some("R2"));
        assert_eq!(previous_unicast(ROUNDS, "nope"), None);
    }

    #[test]
    fn test_inbox_completion_and_duplicates() {
        let mut inbox = RoundInbox::new(ROUNDS, vec![1, 2]);
        inbox.insert(1, "R1", b"a").unwrap();
        inbox.insert(1, "R1", b"dup").unwrap();
        inbox.insert(2, "R3", b"early").unwrap();
        assert!(!inbox.is_complete("R1"));
        inbox.insert(2, "R1", b"b").unwrap();
        assert!(inbox.is_complete("R1"));

        let r1 = inbox.take("R1");
        assert_eq!(r1[&1], b"a".to_vec());
        assert!(!inbox.is_complete("R1"));
        assert!(inbox.insert(3, "R1", b"x").is_err());
        assert!(inbox.insert(1, "R9", b"x").is_err());
    }
}
