//! Versioned per-member gossip state.
//!
//! Each member owns a keyed map of JSON values. Every local write gets a
//! fresh sequence number from a per-member counter shared across keys, so a
//! `(member, sequence)` pair uniquely identifies any state version ever
//! produced. The vector clock records the highest sequence observed from
//! each member and drives delta exchange:
//!
//! ```text
//! A ──pull(A's clock)──> B
//! A <─delta: entries with sequence > A's clock── B
//! ```
//!
//! Merging is last-writer-wins by sequence per `(member, key)`; sequences
//! observed by any peer are non-decreasing over time.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::MemberId;

/// Gossip key a member sets when it departs gracefully.
pub const CLUSTER_LEFT_KEY: &str = "cluster:left";

/// A value with the sequence it was written at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedValue {
    /// The stored value.
    pub value: serde_json::Value,
    /// Originating member's sequence at write time.
    pub sequence: u64,
}

/// One `(member, key, value, sequence)` tuple on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GossipEnvelope {
    /// The member that produced this state.
    pub member: MemberId,
    /// State key.
    pub key: String,
    /// State value.
    pub value: serde_json::Value,
    /// The producing member's sequence for this write.
    pub sequence: u64,
}

/// Per-member keyed state plus the vector clock summarizing it.
#[derive(Debug, Default)]
pub struct GossipState {
    members: HashMap<MemberId, HashMap<String, VersionedValue>>,
    clock: HashMap<MemberId, u64>,
}

impl GossipState {
    /// Create an empty state store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a local write, assigning the next sequence for `local`.
    ///
    /// Returns the assigned sequence.
    pub fn set_local(
        &mut self,
        local: &MemberId,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> u64 {
        let sequence = self.clock.get(local).copied().unwrap_or(0) + 1;
        self.clock.insert(local.clone(), sequence);
        self.members
            .entry(local.clone())
            .or_default()
            .insert(key.into(), VersionedValue { value, sequence });
        sequence
    }

    /// Read a member's value for a key.
    pub fn get(&self, member: &MemberId, key: &str) -> Option<&serde_json::Value> {
        self.members
            .get(member)
            .and_then(|entries| entries.get(key))
            .map(|versioned| &versioned.value)
    }

    /// Current sequence observed for a member (0 if none).
    pub fn sequence_of(&self, member: &MemberId) -> u64 {
        self.clock.get(member).copied().unwrap_or(0)
    }

    /// Snapshot of the vector clock.
    pub fn clock(&self) -> HashMap<MemberId, u64> {
        self.clock.clone()
    }

    /// Entries strictly newer than the given clock, paged to `max_entries`.
    ///
    /// Per member, entries are emitted in ascending sequence order and a
    /// page cut only ever drops a suffix. That keeps the receiver's clock
    /// honest: it never advances past a sequence whose predecessors it has
    /// not merged.
    pub fn entries_after(
        &self,
        clock: &HashMap<MemberId, u64>,
        max_entries: usize,
    ) -> (Vec<GossipEnvelope>, bool) {
        let mut delta = Vec::new();
        let mut truncated = false;

        let mut member_ids: Vec<&MemberId> = self.members.keys().collect();
        member_ids.sort();

        for member in member_ids {
            let known = clock.get(member).copied().unwrap_or(0);
            if self.sequence_of(member) <= known {
                continue;
            }
            let mut entries: Vec<(&String, &VersionedValue)> = self.members[member]
                .iter()
                .filter(|(_, versioned)| versioned.sequence > known)
                .collect();
            entries.sort_by_key(|(_, versioned)| versioned.sequence);

            for (key, versioned) in entries {
                if delta.len() >= max_entries {
                    truncated = true;
                    return (delta, truncated);
                }
                delta.push(GossipEnvelope {
                    member: member.clone(),
                    key: key.clone(),
                    value: versioned.value.clone(),
                    sequence: versioned.sequence,
                });
            }
        }

        (delta, truncated)
    }

    /// Every entry belonging to one member, for the departure broadcast.
    pub fn entries_of(&self, member: &MemberId) -> Vec<GossipEnvelope> {
        let Some(entries) = self.members.get(member) else {
            return Vec::new();
        };
        let mut envelopes: Vec<GossipEnvelope> = entries
            .iter()
            .map(|(key, versioned)| GossipEnvelope {
                member: member.clone(),
                key: key.clone(),
                value: versioned.value.clone(),
                sequence: versioned.sequence,
            })
            .collect();
        envelopes.sort_by_key(|envelope| envelope.sequence);
        envelopes
    }

    /// Merge a delta, keeping the higher sequence per `(member, key)`.
    ///
    /// Returns the envelopes that were actually applied (newer than what was
    /// stored); stale or duplicate envelopes are ignored, which makes merges
    /// idempotent.
    pub fn merge(&mut self, delta: Vec<GossipEnvelope>) -> Vec<GossipEnvelope> {
        let mut applied = Vec::new();
        for envelope in delta {
            let entries = self.members.entry(envelope.member.clone()).or_default();
            let newer = entries
                .get(&envelope.key)
                .is_none_or(|existing| envelope.sequence > existing.sequence);
            if !newer {
                continue;
            }
            entries.insert(
                envelope.key.clone(),
                VersionedValue {
                    value: envelope.value.clone(),
                    sequence: envelope.sequence,
                },
            );
            let clock = self.clock.entry(envelope.member.clone()).or_insert(0);
            if envelope.sequence > *clock {
                *clock = envelope.sequence;
            }
            applied.push(envelope);
        }
        applied
    }
}
