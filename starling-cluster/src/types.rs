//! Core types for the cluster: members, topology snapshots, identities,
//! and activation locations.
//!
//! - [`MemberId`]: lifetime-stable opaque id of a process in the cluster
//! - [`Member`]: a participating process (compared by id)
//! - [`ClusterTopology`]: immutable membership snapshot with deltas
//! - [`ClusterIdentity`]: `(kind, identity)` pair naming a virtual actor
//! - [`Pid`]: physical location of an activation

use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use starling_core::MemberAddress;

/// Seed for the topology hash. Fixed so every member computes the same hash
/// for the same membership.
const TOPOLOGY_HASH_SEED: u64 = 0x5741_524D_4C45_5401;

/// Lifetime-stable opaque identifier of a cluster member.
///
/// A member id is assigned when the process starts and is never reused: a
/// restarted process joins as a brand-new member. Everything that needs to
/// distinguish "the same address, but a different incarnation" keys on this
/// id rather than on the address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberId(String);

impl MemberId {
    /// Create a member id from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MemberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of a member, strictly monotone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    /// The member has announced itself but is not yet serving.
    Joining,
    /// The member is serving traffic.
    Alive,
    /// The member announced a graceful departure.
    Leaving,
    /// The member has left. Terminal.
    Left,
}

impl MemberStatus {
    /// Check whether a transition to `next` respects the monotone lifecycle
    /// `Joining → Alive → Leaving → Left`.
    pub fn can_transition_to(self, next: MemberStatus) -> bool {
        use MemberStatus::*;
        matches!(
            (self, next),
            (Joining, Alive) | (Alive, Leaving) | (Leaving, Left) | (Alive, Left)
        ) || self == next
    }
}

impl std::fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberStatus::Joining => write!(f, "joining"),
            MemberStatus::Alive => write!(f, "alive"),
            MemberStatus::Leaving => write!(f, "leaving"),
            MemberStatus::Left => write!(f, "left"),
        }
    }
}

/// A process participating in the cluster.
///
/// Members are compared and hashed by [`MemberId`] only: address, kinds, and
/// status are descriptive attributes of the same member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    /// Lifetime-stable id.
    pub id: MemberId,
    /// Address peers use to reach this member.
    pub address: MemberAddress,
    /// Grain kinds this member can host.
    pub kinds: Vec<String>,
    /// Current lifecycle status.
    pub status: MemberStatus,
}

impl Member {
    /// Create an alive member.
    pub fn new(id: MemberId, address: MemberAddress, kinds: Vec<String>) -> Self {
        Self {
            id,
            address,
            kinds,
            status: MemberStatus::Alive,
        }
    }

    /// Whether this member can host grains of the given kind.
    pub fn hosts_kind(&self, kind: &str) -> bool {
        self.kinds.iter().any(|k| k == kind)
    }
}

impl PartialEq for Member {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Member {}

impl Hash for Member {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Cluster-wide primary key of a virtual actor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterIdentity {
    kind: String,
    identity: String,
}

impl ClusterIdentity {
    /// Create a new cluster identity from kind and logical identity.
    pub fn new(kind: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            identity: identity.into(),
        }
    }

    /// The registered kind name.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The logical identity component.
    pub fn identity(&self) -> &str {
        &self.identity
    }
}

impl std::fmt::Display for ClusterIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.identity)
    }
}

/// Physical location of a grain activation: the owning member's address plus
/// an opaque process-local id.
///
/// Compared by value. A stale `Pid` (pointing at a departed member or an
/// evicted activation) is detected at send time and invalidated by the
/// caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pid {
    /// Address of the owning member.
    pub address: MemberAddress,
    /// Opaque id of the activation within the owning process.
    pub local_id: String,
}

impl Pid {
    /// Create a new pid.
    pub fn new(address: MemberAddress, local_id: impl Into<String>) -> Self {
        Self {
            address,
            local_id: local_id.into(),
        }
    }
}

impl std::fmt::Display for Pid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.local_id)
    }
}

/// Immutable snapshot of cluster membership, published on every change.
///
/// `joined` and `left` are deltas against the previously published snapshot.
/// `blocked` accumulates every id that has ever left: a blocked id is never
/// re-admitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterTopology {
    /// Deterministic hash over the sorted member-id set.
    pub topology_hash: u64,
    /// All currently alive members.
    pub members: Vec<Member>,
    /// Members present in this snapshot but not the previous one.
    pub joined: Vec<Member>,
    /// Members present in the previous snapshot but not this one.
    pub left: Vec<Member>,
    /// Ids that must never be re-admitted.
    pub blocked: Vec<MemberId>,
}

impl ClusterTopology {
    /// Look up an alive member by id.
    pub fn member(&self, id: &MemberId) -> Option<&Member> {
        self.members.iter().find(|m| &m.id == id)
    }

    /// Alive members that can host grains of the given kind.
    pub fn members_for_kind(&self, kind: &str) -> Vec<&Member> {
        self.members.iter().filter(|m| m.hosts_kind(kind)).collect()
    }
}

/// Compute the deterministic topology hash over a set of member ids.
///
/// The ids are sorted before hashing so the hash is independent of the order
/// in which the provider reported them.
pub fn topology_hash<'a, I>(ids: I) -> u64
where
    I: IntoIterator<Item = &'a MemberId>,
{
    let sorted: BTreeSet<&MemberId> = ids.into_iter().collect();
    let mut hasher = rapidhash::RapidHasher::new(TOPOLOGY_HASH_SEED);
    for id in sorted {
        hasher.write(id.as_str().as_bytes());
        hasher.write_u8(0xff);
    }
    hasher.finish()
}
