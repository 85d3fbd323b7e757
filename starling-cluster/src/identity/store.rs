//! Identity store contract and in-memory implementation.
//!
//! The store is the arbiter of the unique-activation invariant: for any
//! [`ClusterIdentity`] it linearizes reservation compare-and-set operations,
//! so exactly one member wins a placement race and every other caller is
//! told who won.
//!
//! Reservations carry a TTL. A member that dies without releasing leaves
//! records behind; once their TTL expires they are reapable and the next
//! `try_acquire` re-places the identity elsewhere. The lookup refreshes the
//! TTL of its own reservations while it stays alive.
//!
//! In a production deployment this contract is implemented over an external
//! key-value service; [`InMemoryIdentityStore`] is the single-process
//! reference used by tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use starling_core::{MemberAddress, TimeProvider};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::types::{ClusterIdentity, Pid};

/// Errors from the identity store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store could not be reached or failed internally. Transient.
    #[error("identity store unavailable: {0}")]
    Unavailable(String),
    /// The caller's cancellation token fired before the write.
    #[error("store operation cancelled")]
    Cancelled,
}

/// Outcome of a reservation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The caller now owns the identity.
    Acquired,
    /// Somebody else owns it; here is their location.
    HeldBy(Pid),
}

/// Key-value back-end serializing placement decisions.
///
/// All writes are cancellable; cancellation is checked before the write
/// takes effect, so a cancelled call never leaves a reservation behind.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Reserve `identity` for `pid` with the given TTL.
    ///
    /// Compare-and-set: fails with the current owner when a live (non
    /// expired) reservation exists.
    async fn try_acquire(
        &self,
        identity: &ClusterIdentity,
        pid: &Pid,
        ttl: Duration,
        cancel: &CancellationToken,
    ) -> Result<AcquireOutcome, StoreError>;

    /// Extend the TTL of a reservation this owner already holds. A no-op if
    /// the reservation is gone or owned by someone else.
    async fn refresh(
        &self,
        identity: &ClusterIdentity,
        pid: &Pid,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Release one reservation if `pid` still owns it.
    async fn release(&self, identity: &ClusterIdentity, pid: &Pid) -> Result<(), StoreError>;

    /// Release every reservation owned by the given member address.
    /// Returns how many were released.
    async fn release_all(&self, owner: &MemberAddress) -> Result<usize, StoreError>;

    /// Current owner of an identity, if any live reservation exists.
    async fn lookup(
        &self,
        identity: &ClusterIdentity,
        cancel: &CancellationToken,
    ) -> Result<Option<Pid>, StoreError>;
}

struct Reservation {
    pid: Pid,
    expires_at: Duration,
}

/// Single-process identity store with TTL expiry.
pub struct InMemoryIdentityStore<T: TimeProvider> {
    time: T,
    entries: Mutex<HashMap<ClusterIdentity, Reservation>>,
}

impl<T: TimeProvider> InMemoryIdentityStore<T> {
    /// Create an empty store reading time from `time`.
    pub fn new(time: T) -> Self {
        Self {
            time,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live (non expired) reservations. Test hook for the
    /// single-writer and post-shutdown invariants.
    pub fn live_reservations(&self) -> usize {
        let now = self.time.now();
        self.entries
            .lock()
            .expect("store lock poisoned")
            .values()
            .filter(|r| r.expires_at > now)
            .count()
    }

    /// Live reservations owned by the given address. Test hook.
    pub fn reservations_of(&self, owner: &MemberAddress) -> Vec<ClusterIdentity> {
        let now = self.time.now();
        self.entries
            .lock()
            .expect("store lock poisoned")
            .iter()
            .filter(|(_, r)| r.pid.address == *owner && r.expires_at > now)
            .map(|(identity, _)| identity.clone())
            .collect()
    }
}

#[async_trait]
impl<T: TimeProvider> IdentityStore for InMemoryIdentityStore<T> {
    async fn try_acquire(
        &self,
        identity: &ClusterIdentity,
        pid: &Pid,
        ttl: Duration,
        cancel: &CancellationToken,
    ) -> Result<AcquireOutcome, StoreError> {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let now = self.time.now();
        let mut entries = self.entries.lock().expect("store lock poisoned");
        if let Some(existing) = entries.get(identity) {
            if existing.expires_at > now {
                return Ok(AcquireOutcome::HeldBy(existing.pid.clone()));
            }
            debug!(identity = %identity, "expired reservation reaped on acquire");
        }
        entries.insert(
            identity.clone(),
            Reservation {
                pid: pid.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(AcquireOutcome::Acquired)
    }

    async fn refresh(
        &self,
        identity: &ClusterIdentity,
        pid: &Pid,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let now = self.time.now();
        let mut entries = self.entries.lock().expect("store lock poisoned");
        if let Some(existing) = entries.get_mut(identity)
            && existing.pid == *pid
        {
            existing.expires_at = now + ttl;
        }
        Ok(())
    }

    async fn release(&self, identity: &ClusterIdentity, pid: &Pid) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().expect("store lock poisoned");
        if entries.get(identity).is_some_and(|r| r.pid == *pid) {
            entries.remove(identity);
        }
        Ok(())
    }

    async fn release_all(&self, owner: &MemberAddress) -> Result<usize, StoreError> {
        let mut entries = self.entries.lock().expect("store lock poisoned");
        let before = entries.len();
        entries.retain(|_, r| r.pid.address != *owner);
        Ok(before - entries.len())
    }

    async fn lookup(
        &self,
        identity: &ClusterIdentity,
        cancel: &CancellationToken,
    ) -> Result<Option<Pid>, StoreError> {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let now = self.time.now();
        let entries = self.entries.lock().expect("store lock poisoned");
        Ok(entries
            .get(identity)
            .filter(|r| r.expires_at > now)
            .map(|r| r.pid.clone()))
    }
}
