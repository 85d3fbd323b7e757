//! Anti-entropy gossip loop.
//!
//! Every `gossip_interval` the local member pulls from up to `gossip_fan_out`
//! random alive peers: it sends its vector clock, the peer answers with
//! every entry strictly newer than that clock, and the delta is merged
//! last-writer-wins by sequence. Messages are idempotent and may be dropped;
//! convergence is probabilistic with expected time
//! `O(log N · gossip_interval)`.
//!
//! ```text
//! tick ─> sample peers ─> pull(clock) ─> merge delta ─> evaluate consensus
//!              │
//!              └ skip peers suspected after repeated RPC failures
//! ```
//!
//! RPC failures are not surfaced: the next tick retries with different
//! peers. A peer that keeps failing is *suspected* and skipped until a
//! membership update reassesses it.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use starling_core::{Providers, RandomProvider, TaskProvider, TimeProvider};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::consensus::{ConsensusHandle, ConsensusProjection, ConsensusTracker};
use super::state::{CLUSTER_LEFT_KEY, GossipEnvelope, GossipState};
use crate::error::ClusterError;
use crate::events::{ClusterEvent, EventBus};
use crate::member_list::MemberList;
use crate::transport::{ClusterMessage, ClusterTransport};
use crate::types::{ClusterTopology, Member, MemberId};

/// Exchange timeout as a multiple of the tick interval. A pull that takes
/// longer than this counts as a failure; the next tick retries with
/// different peers.
const EXCHANGE_TIMEOUT_TICKS: u32 = 5;

/// Timing and shape knobs for the gossiper, extracted from the cluster
/// configuration.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Tick cadence.
    pub interval: Duration,
    /// Peers pulled per tick (clamped to the alive peer count).
    pub fan_out: usize,
    /// Page size for deltas.
    pub max_delta_entries: usize,
    /// Consecutive failures before a peer is suspected.
    pub suspect_threshold: u32,
}

struct GossipShared {
    local_id: MemberId,
    config: GossipConfig,
    state: Mutex<GossipState>,
    consensus: Mutex<ConsensusTracker>,
    suspicion: Mutex<HashMap<MemberId, u32>>,
    left_seen: Mutex<HashSet<MemberId>>,
    running: AtomicBool,
    member_list: Arc<MemberList>,
    transport: Arc<dyn ClusterTransport>,
    event_bus: Arc<EventBus>,
}

/// Per-member eventually-consistent keyed store with consensus checks.
pub struct Gossiper<P: Providers> {
    providers: P,
    shared: Arc<GossipShared>,
    shutdown: CancellationToken,
    tick_task: Mutex<Option<JoinHandle<()>>>,
}

impl<P: Providers> Gossiper<P> {
    /// Create a gossiper. Call [`Gossiper::start`] to begin ticking.
    pub fn new(
        providers: P,
        config: GossipConfig,
        member_list: Arc<MemberList>,
        transport: Arc<dyn ClusterTransport>,
        event_bus: Arc<EventBus>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let local_id = member_list.local().id.clone();
        Arc::new(Self {
            providers,
            shared: Arc::new(GossipShared {
                local_id,
                config,
                state: Mutex::new(GossipState::new()),
                consensus: Mutex::new(ConsensusTracker::new()),
                suspicion: Mutex::new(HashMap::new()),
                left_seen: Mutex::new(HashSet::new()),
                running: AtomicBool::new(false),
                member_list,
                transport,
                event_bus,
            }),
            shutdown,
            tick_task: Mutex::new(None),
        })
    }

    /// Spawn the gossip tick loop. Sets/gets become valid.
    pub fn start(&self) {
        self.shared.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let time = self.providers.time().clone();
        let random = self.providers.random().clone();
        let shutdown = self.shutdown.clone();
        let handle = self.providers.task().spawn_task("gossip-tick", async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = time.sleep(shared.config.interval) => {}
                }
                // Faults stay inside the loop; the next tick starts clean.
                shared.tick(&random).await;
            }
            debug!("gossip tick loop stopped");
        });
        *self.tick_task.lock().expect("tick task lock poisoned") = Some(handle);
    }

    /// Write a key in the local member's gossip state.
    pub fn set_state(
        &self,
        key: &str,
        value: serde_json::Value,
    ) -> Result<u64, ClusterError> {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(ClusterError::Unavailable);
        }
        let sequence = self
            .shared
            .state
            .lock()
            .expect("gossip state lock poisoned")
            .set_local(&self.shared.local_id, key, value);
        trace!(key, sequence, "local gossip write");
        self.shared.evaluate_consensus();
        Ok(sequence)
    }

    /// Read a member's value for a key.
    pub fn get_state(
        &self,
        member: &MemberId,
        key: &str,
    ) -> Result<Option<serde_json::Value>, ClusterError> {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(ClusterError::Unavailable);
        }
        Ok(self
            .shared
            .state
            .lock()
            .expect("gossip state lock poisoned")
            .get(member, key)
            .cloned())
    }

    /// Register a consensus check over `key` (values compared directly).
    pub fn register_consensus_check(&self, key: &str) -> ConsensusHandle {
        self.register_consensus_check_with(key, None)
    }

    /// Register a consensus check with a projection applied to each value
    /// before comparison.
    pub fn register_consensus_check_with(
        &self,
        key: &str,
        projection: Option<ConsensusProjection>,
    ) -> ConsensusHandle {
        let handle = self
            .shared
            .consensus
            .lock()
            .expect("consensus lock poisoned")
            .register(key, projection);
        self.shared.evaluate_consensus();
        handle
    }

    /// Current consensus generation.
    pub fn consensus_generation(&self) -> u64 {
        self.shared
            .consensus
            .lock()
            .expect("consensus lock poisoned")
            .generation()
    }

    /// Reassess consensus and peer suspicion against a new topology.
    ///
    /// Wired by the orchestrator as a topology subscriber.
    pub fn on_topology(&self, topology: &ClusterTopology) {
        self.shared.on_topology(topology);
    }

    /// Serve a pull: entries strictly newer than the requester's clock.
    pub fn handle_pull(
        &self,
        clock: &HashMap<MemberId, u64>,
    ) -> (Vec<GossipEnvelope>, bool) {
        self.shared
            .state
            .lock()
            .expect("gossip state lock poisoned")
            .entries_after(clock, self.shared.config.max_delta_entries)
    }

    /// Merge a pushed delta (departure broadcasts).
    pub fn handle_push(&self, entries: Vec<GossipEnvelope>) {
        self.shared.apply_delta(entries);
    }

    /// Announce graceful departure: set `cluster:left`, push the local state
    /// to every alive peer, then wait two gossip intervals for propagation.
    pub async fn announce_left(&self, reason: &str) {
        info!(reason, "announcing graceful departure");
        {
            let mut state = self.shared.state.lock().expect("gossip state lock poisoned");
            state.set_local(
                &self.shared.local_id,
                CLUSTER_LEFT_KEY,
                serde_json::json!(reason),
            );
        }
        let entries = {
            let state = self.shared.state.lock().expect("gossip state lock poisoned");
            state.entries_of(&self.shared.local_id)
        };
        for peer in self.shared.member_list.alive_peers() {
            let push = ClusterMessage::GossipPush {
                entries: entries.clone(),
            };
            if let Err(error) = self.shared.transport.send(&peer.address, push).await {
                debug!(peer = %peer.id, %error, "departure push failed");
            }
        }
        self.providers
            .time()
            .sleep(self.shared.config.interval * 2)
            .await;
    }

    /// Stop the tick loop. Sets/gets become invalid.
    pub async fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let handle = self
            .tick_task
            .lock()
            .expect("tick task lock poisoned")
            .take();
        if let Some(handle) = handle {
            self.shutdown.cancel();
            let _ = handle.await;
        }
    }
}

impl GossipShared {
    async fn tick<R: RandomProvider>(&self, random: &R) {
        let peers = self.pick_peers(random);
        if peers.is_empty() {
            return;
        }
        let clock = {
            let state = self.state.lock().expect("gossip state lock poisoned");
            state.clock()
        };
        for peer in peers {
            let pull = ClusterMessage::GossipPull {
                from: self.local_id.clone(),
                clock: clock.clone(),
            };
            let reply = self
                .transport
                .request(
                    &peer.address,
                    pull,
                    self.config.interval * EXCHANGE_TIMEOUT_TICKS,
                )
                .await;
            match reply {
                Ok(ClusterMessage::GossipDelta { entries, truncated }) => {
                    self.clear_suspicion(&peer.id);
                    if truncated {
                        trace!(peer = %peer.id, "gossip delta paged, remainder next tick");
                    }
                    self.apply_delta(entries);
                }
                Ok(other) => {
                    warn!(peer = %peer.id, ?other, "unexpected gossip reply");
                    self.record_failure(&peer.id);
                }
                Err(error) => {
                    debug!(peer = %peer.id, %error, "gossip exchange failed");
                    self.record_failure(&peer.id);
                }
            }
        }
    }

    /// Sample up to `fan_out` distinct non-suspected peers uniformly.
    fn pick_peers<R: RandomProvider>(&self, random: &R) -> Vec<Member> {
        let suspicion = self.suspicion.lock().expect("suspicion lock poisoned");
        let mut peers: Vec<Member> = self
            .member_list
            .alive_peers()
            .into_iter()
            .filter(|peer| {
                suspicion
                    .get(&peer.id)
                    .is_none_or(|count| *count < self.config.suspect_threshold)
            })
            .collect();
        drop(suspicion);

        let count = self.config.fan_out.min(peers.len());
        // Partial Fisher-Yates: the first `count` slots end up uniform.
        for i in 0..count {
            let j = i + random.pick_index(peers.len() - i);
            peers.swap(i, j);
        }
        peers.truncate(count);
        peers
    }

    fn apply_delta(&self, entries: Vec<GossipEnvelope>) {
        if entries.is_empty() {
            return;
        }
        let applied = {
            let mut state = self.state.lock().expect("gossip state lock poisoned");
            state.merge(entries)
        };
        if applied.is_empty() {
            return;
        }
        for envelope in &applied {
            if envelope.key == CLUSTER_LEFT_KEY && envelope.member != self.local_id {
                let newly_seen = self
                    .left_seen
                    .lock()
                    .expect("left-seen lock poisoned")
                    .insert(envelope.member.clone());
                if newly_seen {
                    info!(member = %envelope.member, "peer announced graceful departure");
                    self.event_bus
                        .publish(&ClusterEvent::MemberLeftGracefully(envelope.member.clone()));
                }
            }
        }
        self.evaluate_consensus();
    }

    fn on_topology(&self, topology: &ClusterTopology) {
        let alive: BTreeSet<MemberId> =
            topology.members.iter().map(|m| m.id.clone()).collect();
        {
            // A membership change reassesses every suspect.
            let mut suspicion = self.suspicion.lock().expect("suspicion lock poisoned");
            suspicion.clear();
        }
        let changed = {
            let mut consensus = self.consensus.lock().expect("consensus lock poisoned");
            consensus.set_alive(alive)
        };
        if changed {
            self.evaluate_consensus();
        }
    }

    fn evaluate_consensus(&self) {
        let reached = {
            let state = self.state.lock().expect("gossip state lock poisoned");
            let mut consensus = self.consensus.lock().expect("consensus lock poisoned");
            consensus.evaluate(&state)
        };
        for (generation, key, _value) in reached {
            info!(generation, key = %key, "consensus reached");
            self.event_bus.publish(&ClusterEvent::ConsensusReached {
                generation,
                key,
            });
        }
    }

    fn record_failure(&self, peer: &MemberId) {
        let mut suspicion = self.suspicion.lock().expect("suspicion lock poisoned");
        let count = suspicion.entry(peer.clone()).or_insert(0);
        *count += 1;
        if *count == self.config.suspect_threshold {
            warn!(peer = %peer, failures = *count, "peer suspected, skipping until membership update");
        }
    }

    fn clear_suspicion(&self, peer: &MemberId) {
        self.suspicion
            .lock()
            .expect("suspicion lock poisoned")
            .remove(peer);
    }
}
