//! Authoritative local view of cluster membership.
//!
//! The provider feeds full member reports in; the member list reconciles
//! them against its current set and publishes a [`ClusterTopology`] snapshot
//! on every real change. Publication is synchronous: every subscriber (PID
//! cache eviction first among them) completes before the next report is
//! accepted, which is what makes the cache-soundness invariant hold.
//!
//! ```text
//! Provider ──report──> MemberList ──TopologyChanged──> subscribers
//!                         │                             (PidCache,
//!                         │ suppressed when hash         Gossiper,
//!                         ▼ is unchanged                 Metrics)
//!                   current snapshot
//! ```
//!
//! Once an id lands in the blocked set it is filtered out of every future
//! report: a member that left can never be re-admitted under the same id.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::events::{ClusterEvent, EventBus};
use crate::types::{ClusterTopology, Member, MemberId, MemberStatus, topology_hash};

struct MemberSet {
    members: HashMap<MemberId, Member>,
    blocked: HashSet<MemberId>,
    topology_hash: u64,
}

/// Authoritative membership view with synchronous topology publication.
pub struct MemberList {
    local: Member,
    is_client: bool,
    event_bus: Arc<EventBus>,
    /// Guards reconciliation + publication as one critical section.
    set: Mutex<MemberSet>,
    /// Latest published snapshot, readable without touching the set lock.
    current: RwLock<Arc<ClusterTopology>>,
    started_tx: watch::Sender<bool>,
    updates_tx: watch::Sender<u64>,
    fenced_tx: watch::Sender<Option<String>>,
    last_seen_self: Mutex<Option<Duration>>,
}

impl MemberList {
    /// Create a member list for the given local member.
    ///
    /// `is_client` relaxes the started signal: clients never appear in the
    /// membership they observe.
    pub fn new(local: Member, is_client: bool, event_bus: Arc<EventBus>) -> Arc<Self> {
        let empty_hash = topology_hash([]);
        let initial = Arc::new(ClusterTopology {
            topology_hash: empty_hash,
            members: Vec::new(),
            joined: Vec::new(),
            left: Vec::new(),
            blocked: Vec::new(),
        });
        let (started_tx, _) = watch::channel(false);
        let (updates_tx, _) = watch::channel(0u64);
        let (fenced_tx, _) = watch::channel(None);
        Arc::new(Self {
            local,
            is_client,
            event_bus,
            set: Mutex::new(MemberSet {
                members: HashMap::new(),
                blocked: HashSet::new(),
                topology_hash: empty_hash,
            }),
            current: RwLock::new(initial),
            started_tx,
            updates_tx,
            fenced_tx,
            last_seen_self: Mutex::new(None),
        })
    }

    /// Reconcile a full membership report from the provider.
    ///
    /// Suppresses publication when the resulting member-id set is unchanged.
    /// Blocked ids are dropped from the report before reconciliation.
    pub fn update_members(&self, reported: Vec<Member>, now: Duration) {
        let mut set = self.set.lock().expect("member set lock poisoned");

        let mut candidate: HashMap<MemberId, Member> = HashMap::new();
        for mut member in reported {
            if set.blocked.contains(&member.id) {
                debug!(member_id = %member.id, "dropping blocked member from report");
                continue;
            }
            member.status = MemberStatus::Alive;
            candidate.insert(member.id.clone(), member);
        }

        if candidate.contains_key(&self.local.id) {
            *self
                .last_seen_self
                .lock()
                .expect("self-seen lock poisoned") = Some(now);
            if !*self.started_tx.borrow() {
                info!(member_id = %self.local.id, "local member visible in cluster");
                let _ = self.started_tx.send(true);
            }
        }

        let new_hash = topology_hash(candidate.keys());
        if new_hash == set.topology_hash {
            self.record_update();
            return;
        }

        let joined: Vec<Member> = candidate
            .values()
            .filter(|m| !set.members.contains_key(&m.id))
            .cloned()
            .collect();
        let left: Vec<Member> = set
            .members
            .values()
            .filter(|m| !candidate.contains_key(&m.id))
            .cloned()
            .map(|mut m| {
                m.status = MemberStatus::Left;
                m
            })
            .collect();

        for member in &left {
            set.blocked.insert(member.id.clone());
        }

        set.members = candidate;
        set.topology_hash = new_hash;

        let mut members: Vec<Member> = set.members.values().cloned().collect();
        members.sort_by(|a, b| a.id.cmp(&b.id));
        let mut blocked: Vec<MemberId> = set.blocked.iter().cloned().collect();
        blocked.sort();

        let snapshot = Arc::new(ClusterTopology {
            topology_hash: new_hash,
            members,
            joined: joined.clone(),
            left: left.clone(),
            blocked,
        });

        info!(
            topology_hash = new_hash,
            members = snapshot.members.len(),
            joined = joined.len(),
            left = left.len(),
            "topology changed"
        );

        *self.current.write().expect("current snapshot lock poisoned") = Arc::clone(&snapshot);

        // Synchronous publication: subscribers (cache eviction included)
        // finish before the set lock is released and the next report runs.
        self.event_bus
            .publish(&ClusterEvent::TopologyChanged(snapshot));

        drop(set);
        self.record_update();
    }

    fn record_update(&self) {
        self.updates_tx.send_modify(|count| *count += 1);
    }

    /// Latest published snapshot.
    pub fn current(&self) -> Arc<ClusterTopology> {
        Arc::clone(&self.current.read().expect("current snapshot lock poisoned"))
    }

    /// Alive members excluding the local one.
    pub fn alive_peers(&self) -> Vec<Member> {
        self.current()
            .members
            .iter()
            .filter(|m| m.id != self.local.id)
            .cloned()
            .collect()
    }

    /// The local member descriptor.
    pub fn local(&self) -> &Member {
        &self.local
    }

    /// Whether this list belongs to a client (non-hosting) node.
    pub fn is_client(&self) -> bool {
        self.is_client
    }

    /// Wait until the local member first sees itself in the membership.
    pub async fn wait_started(&self) {
        let mut rx = self.started_tx.subscribe();
        // Closed sender means the list is gone; treat as started to unblock.
        let _ = rx.wait_for(|started| *started).await;
    }

    /// Wait until at least one provider report has been processed.
    pub async fn wait_first_update(&self) {
        let mut rx = self.updates_tx.subscribe();
        let _ = rx.wait_for(|count| *count > 0).await;
    }

    /// Whether the started signal has fired.
    pub fn is_started(&self) -> bool {
        *self.started_tx.borrow()
    }

    /// Check provider-reported self visibility against the health timeout.
    ///
    /// Returns `false` (and fences the member) when the provider has not
    /// reported the local member for longer than `timeout`. Members that
    /// were never seen yet are healthy: startup gates on the started signal.
    pub fn check_self_health(&self, now: Duration, timeout: Duration) -> bool {
        if self.is_client {
            return true;
        }
        let last_seen = *self.last_seen_self.lock().expect("self-seen lock poisoned");
        match last_seen {
            Some(seen) if now.saturating_sub(seen) > timeout => {
                warn!(
                    member_id = %self.local.id,
                    since = ?now.saturating_sub(seen),
                    "provider no longer reports local member, fencing"
                );
                self.fence("provider stopped reporting local member");
                false
            }
            _ => true,
        }
    }

    /// Mark the local member as fenced with the given reason.
    pub fn fence(&self, reason: &str) {
        let _ = self.fenced_tx.send(Some(reason.to_string()));
    }

    /// Watch receiver that yields a reason once the member is fenced.
    pub fn fenced(&self) -> watch::Receiver<Option<String>> {
        self.fenced_tx.subscribe()
    }
}
