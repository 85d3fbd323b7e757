//! Rendezvous (highest-random-weight) owner selection.
//!
//! Each `(member, identity)` pair is hashed with a fixed seed; the member
//! with the highest score is the owner candidate. Every member computes the
//! same candidate for the same topology, and removing one member only
//! reassigns the identities that member owned.

use std::hash::Hasher;

use crate::types::{ClusterIdentity, Member};

const RENDEZVOUS_SEED: u64 = 0x5741_524D_4C45_5402;

fn score(member: &Member, identity: &ClusterIdentity) -> u64 {
    let mut hasher = rapidhash::RapidHasher::new(RENDEZVOUS_SEED);
    hasher.write(member.id.as_str().as_bytes());
    hasher.write_u8(0xff);
    hasher.write(identity.kind().as_bytes());
    hasher.write_u8(0xff);
    hasher.write(identity.identity().as_bytes());
    hasher.finish()
}

/// Pick the owner candidate for `identity` among `members`.
///
/// Ties (vanishingly unlikely) break toward the smaller member id so the
/// choice stays deterministic across processes.
pub fn select_owner<'a>(
    members: &[&'a Member],
    identity: &ClusterIdentity,
) -> Option<&'a Member> {
    members
        .iter()
        .copied()
        .max_by(|a, b| {
            score(a, identity)
                .cmp(&score(b, identity))
                .then_with(|| b.id.cmp(&a.id))
        })
}
