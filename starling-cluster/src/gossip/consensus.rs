//! Cluster-wide consensus over gossip keys.
//!
//! A consensus check watches one gossip key and is *reached* when every
//! currently-alive member (according to the member list) has published a
//! value for that key and all values agree under the check's projection.
//!
//! Results are one-shot per generation: every change to the alive set
//! starts a new generation and re-arms every check, so callers can await
//! agreement for "the cluster as it is now".

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::watch;

use super::state::GossipState;
use crate::types::MemberId;

/// Projection applied to each member's value before comparison.
pub type ConsensusProjection =
    Arc<dyn Fn(&serde_json::Value) -> serde_json::Value + Send + Sync>;

/// A reached consensus: the generation it was reached in and the agreed
/// (projected) value.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusResult {
    /// Generation of the alive set the agreement was observed against.
    pub generation: u64,
    /// The agreed value.
    pub value: serde_json::Value,
}

/// Caller-side handle to a registered consensus check.
pub struct ConsensusHandle {
    key: String,
    rx: watch::Receiver<Option<ConsensusResult>>,
}

impl ConsensusHandle {
    /// The gossip key this check watches.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Latest result for the current generation, if reached.
    pub fn latest(&self) -> Option<ConsensusResult> {
        self.rx.borrow().clone()
    }

    /// Wait until consensus is reached for the current generation.
    ///
    /// Returns `None` if the gossiper shut down before agreement.
    pub async fn reached(&mut self) -> Option<ConsensusResult> {
        match self.rx.wait_for(|result| result.is_some()).await {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        }
    }
}

struct CheckState {
    key: String,
    projection: Option<ConsensusProjection>,
    tx: watch::Sender<Option<ConsensusResult>>,
    signaled: Option<u64>,
}

/// Tracks registered checks, the alive set, and the consensus generation.
pub(crate) struct ConsensusTracker {
    generation: u64,
    alive: BTreeSet<MemberId>,
    checks: Vec<CheckState>,
}

impl ConsensusTracker {
    pub(crate) fn new() -> Self {
        Self {
            generation: 0,
            alive: BTreeSet::new(),
            checks: Vec::new(),
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Register a check over `key`, with an optional projection.
    pub(crate) fn register(
        &mut self,
        key: &str,
        projection: Option<ConsensusProjection>,
    ) -> ConsensusHandle {
        let (tx, rx) = watch::channel(None);
        self.checks.push(CheckState {
            key: key.to_string(),
            projection,
            tx,
            signaled: None,
        });
        ConsensusHandle {
            key: key.to_string(),
            rx,
        }
    }

    /// Install a new alive set. A change starts a new generation and
    /// re-arms every check.
    pub(crate) fn set_alive(&mut self, alive: BTreeSet<MemberId>) -> bool {
        if alive == self.alive {
            return false;
        }
        self.alive = alive;
        self.generation += 1;
        for check in &mut self.checks {
            check.signaled = None;
            check.tx.send_replace(None);
        }
        true
    }

    /// Evaluate all unsignaled checks against the state.
    ///
    /// Returns `(generation, key, value)` for every check that just reached
    /// agreement, for event publication by the caller.
    pub(crate) fn evaluate(
        &mut self,
        state: &GossipState,
    ) -> Vec<(u64, String, serde_json::Value)> {
        if self.alive.is_empty() {
            return Vec::new();
        }
        let generation = self.generation;
        let mut reached = Vec::new();

        for check in &mut self.checks {
            if check.signaled == Some(generation) {
                continue;
            }
            let mut agreed: Option<serde_json::Value> = None;
            let mut all_agree = true;
            for member in &self.alive {
                let Some(value) = state.get(member, &check.key) else {
                    all_agree = false;
                    break;
                };
                let projected = match &check.projection {
                    Some(projection) => projection(value),
                    None => value.clone(),
                };
                match &agreed {
                    None => agreed = Some(projected),
                    Some(existing) if *existing == projected => {}
                    Some(_) => {
                        all_agree = false;
                        break;
                    }
                }
            }
            if let (true, Some(value)) = (all_agree, agreed) {
                check.signaled = Some(generation);
                check.tx.send_replace(Some(ConsensusResult {
                    generation,
                    value: value.clone(),
                }));
                reached.push((generation, check.key.clone(), value));
            }
        }
        reached
    }
}
