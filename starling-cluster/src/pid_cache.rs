//! Cache of resolved grain locations.
//!
//! Maps [`ClusterIdentity`] to the last known [`Pid`], with a reverse index
//! by owning member address so that a topology change evicts every entry for
//! a departed member in one pass. The reverse index is maintained
//! incrementally under the same lock as the forward map, keeping the two
//! views atomic with respect to each other.
//!
//! Time-based eviction runs in a background task when both the clear
//! interval and the TTL are positive; topology-driven eviction always runs,
//! wired by the orchestrator as a topology subscriber.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use starling_core::{Providers, TaskProvider, TimeProvider};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::types::{ClusterIdentity, Pid};
use starling_core::MemberAddress;

/// A cached location with its idle timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidCacheEntry {
    /// The resolved location.
    pub pid: Pid,
    /// Last time the entry was inserted or touched.
    pub last_touched: Duration,
}

struct CacheInner {
    forward: HashMap<ClusterIdentity, PidCacheEntry>,
    by_member: HashMap<MemberAddress, HashSet<ClusterIdentity>>,
}

/// Thread-safe identity → location cache with a by-member reverse index.
pub struct PidCache {
    inner: Mutex<CacheInner>,
}

impl PidCache {
    /// Create an empty cache.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(CacheInner {
                forward: HashMap::new(),
                by_member: HashMap::new(),
            }),
        })
    }

    /// Fetch the cached location for an identity.
    pub fn try_get(&self, identity: &ClusterIdentity) -> Option<Pid> {
        self.inner
            .lock()
            .expect("pid cache lock poisoned")
            .forward
            .get(identity)
            .map(|entry| entry.pid.clone())
    }

    /// Insert a location if the identity is not cached yet.
    ///
    /// Conflict resolution is first-writer-wins: a concurrent insert for the
    /// same identity keeps the existing entry. Returns `true` when this call
    /// inserted.
    pub fn try_set(&self, identity: &ClusterIdentity, pid: Pid, now: Duration) -> bool {
        let mut inner = self.inner.lock().expect("pid cache lock poisoned");
        if inner.forward.contains_key(identity) {
            return false;
        }
        inner
            .by_member
            .entry(pid.address.clone())
            .or_default()
            .insert(identity.clone());
        inner.forward.insert(
            identity.clone(),
            PidCacheEntry {
                pid,
                last_touched: now,
            },
        );
        true
    }

    /// Refresh the idle timestamp of a cached entry.
    pub fn touch(&self, identity: &ClusterIdentity, now: Duration) {
        let mut inner = self.inner.lock().expect("pid cache lock poisoned");
        if let Some(entry) = inner.forward.get_mut(identity) {
            entry.last_touched = now;
        }
    }

    /// Remove one identity. Returns the evicted location, if any.
    pub fn remove(&self, identity: &ClusterIdentity) -> Option<Pid> {
        let mut inner = self.inner.lock().expect("pid cache lock poisoned");
        let entry = inner.forward.remove(identity)?;
        if let Some(set) = inner.by_member.get_mut(&entry.pid.address) {
            set.remove(identity);
            if set.is_empty() {
                inner.by_member.remove(&entry.pid.address);
            }
        }
        Some(entry.pid)
    }

    /// Remove every entry owned by the given member address.
    pub fn remove_by_member(&self, address: &MemberAddress) -> Vec<ClusterIdentity> {
        let mut inner = self.inner.lock().expect("pid cache lock poisoned");
        let Some(identities) = inner.by_member.remove(address) else {
            return Vec::new();
        };
        let mut removed = Vec::with_capacity(identities.len());
        for identity in identities {
            inner.forward.remove(&identity);
            removed.push(identity);
        }
        if !removed.is_empty() {
            debug!(member = %address, evicted = removed.len(), "evicted cache entries for departed member");
        }
        removed
    }

    /// Remove entries whose `last_touched` precedes `now − ttl`.
    pub fn remove_idle_older_than(&self, ttl: Duration, now: Duration) -> usize {
        let cutoff = now.saturating_sub(ttl);
        let mut inner = self.inner.lock().expect("pid cache lock poisoned");
        let idle: Vec<(ClusterIdentity, MemberAddress)> = inner
            .forward
            .iter()
            .filter(|(_, entry)| entry.last_touched < cutoff)
            .map(|(identity, entry)| (identity.clone(), entry.pid.address.clone()))
            .collect();
        for (identity, address) in &idle {
            inner.forward.remove(identity);
            if let Some(set) = inner.by_member.get_mut(address) {
                set.remove(identity);
                if set.is_empty() {
                    inner.by_member.remove(address);
                }
            }
        }
        idle.len()
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("pid cache lock poisoned").forward.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn the periodic idle-eviction task.
    ///
    /// The caller must only invoke this when both parameters are positive;
    /// the orchestrator checks `pid_cache_cleanup_enabled` first. The task
    /// exits when `shutdown` fires.
    pub fn spawn_cleanup<P: Providers>(
        self: &Arc<Self>,
        providers: &P,
        interval: Duration,
        ttl: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let time = providers.time().clone();
        providers.task().spawn_task("pid-cache-cleanup", async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = time.sleep(interval) => {}
                }
                let removed = cache.remove_idle_older_than(ttl, time.now());
                if removed > 0 {
                    trace!(removed, "pid cache idle eviction");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(n: u32) -> ClusterIdentity {
        ClusterIdentity::new("counter", format!("id-{n}"))
    }

    fn pid(port: u16, local: &str) -> Pid {
        Pid::new(MemberAddress::new("127.0.0.1", port), local)
    }

    #[test]
    fn test_set_get_remove() {
        let cache = PidCache::new();
        let id = identity(1);
        let p = pid(4001, "a$1");

        assert!(cache.try_set(&id, p.clone(), Duration::ZERO));
        assert_eq!(cache.try_get(&id), Some(p.clone()));
        assert_eq!(cache.remove(&id), Some(p));
        assert!(cache.try_get(&id).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_first_writer_wins() {
        let cache = PidCache::new();
        let id = identity(1);
        let first = pid(4001, "a$1");
        let second = pid(4002, "b$1");

        assert!(cache.try_set(&id, first.clone(), Duration::ZERO));
        assert!(!cache.try_set(&id, second, Duration::ZERO));
        assert_eq!(cache.try_get(&id), Some(first));
    }

    #[test]
    fn test_remove_by_member_only_evicts_that_member() {
        let cache = PidCache::new();
        cache.try_set(&identity(1), pid(4001, "a$1"), Duration::ZERO);
        cache.try_set(&identity(2), pid(4001, "a$2"), Duration::ZERO);
        cache.try_set(&identity(3), pid(4002, "b$1"), Duration::ZERO);

        let removed = cache.remove_by_member(&MemberAddress::new("127.0.0.1", 4001));
        assert_eq!(removed.len(), 2);
        assert!(cache.try_get(&identity(1)).is_none());
        assert!(cache.try_get(&identity(2)).is_none());
        assert!(cache.try_get(&identity(3)).is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_remove_by_member_unknown_address_is_empty() {
        let cache = PidCache::new();
        cache.try_set(&identity(1), pid(4001, "a$1"), Duration::ZERO);
        let removed = cache.remove_by_member(&MemberAddress::new("10.0.0.9", 1));
        assert!(removed.is_empty());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_reverse_index_follows_remove_and_reinsert() {
        let cache = PidCache::new();
        let id = identity(1);
        cache.try_set(&id, pid(4001, "a$1"), Duration::ZERO);
        cache.remove(&id);

        // Re-insert under a different member; the old reverse entry is gone.
        cache.try_set(&id, pid(4002, "b$1"), Duration::ZERO);
        assert!(
            cache
                .remove_by_member(&MemberAddress::new("127.0.0.1", 4001))
                .is_empty()
        );
        assert_eq!(
            cache.remove_by_member(&MemberAddress::new("127.0.0.1", 4002)),
            vec![id]
        );
    }

    #[test]
    fn test_idle_eviction_respects_touch() {
        let cache = PidCache::new();
        let stale = identity(1);
        let fresh = identity(2);
        cache.try_set(&stale, pid(4001, "a$1"), Duration::from_secs(0));
        cache.try_set(&fresh, pid(4001, "a$2"), Duration::from_secs(0));
        cache.touch(&fresh, Duration::from_secs(50));

        let removed = cache.remove_idle_older_than(Duration::from_secs(20), Duration::from_secs(60));
        assert_eq!(removed, 1);
        assert!(cache.try_get(&stale).is_none());
        assert!(cache.try_get(&fresh).is_some());
    }

    #[test]
    fn test_idle_eviction_boundary() {
        let cache = PidCache::new();
        let id = identity(1);
        cache.try_set(&id, pid(4001, "a$1"), Duration::from_secs(40));

        // last_touched == cutoff is not "older than".
        let removed = cache.remove_idle_older_than(Duration::from_secs(20), Duration::from_secs(60));
        assert_eq!(removed, 0);
        assert!(cache.try_get(&id).is_some());
    }

    #[tokio::test]
    async fn test_cleanup_task_evicts_and_stops() {
        use starling_core::TokioProviders;

        let providers = TokioProviders::new();
        let cache = PidCache::new();
        cache.try_set(&identity(1), pid(4001, "a$1"), Duration::ZERO);

        let shutdown = CancellationToken::new();
        let handle = cache.spawn_cleanup(
            &providers,
            Duration::from_millis(10),
            Duration::from_millis(1),
            shutdown.clone(),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.is_empty());

        shutdown.cancel();
        handle.await.expect("cleanup task join");
    }
}
