//! Cluster gauges and their observers.
//!
//! Two gauges are published: `cluster.members.count` (per node id and
//! address) and `cluster.virtual_actors.count` (per node id, address, and
//! kind). Observers register a callback at startup and are detached
//! deterministically at shutdown, so no samples are emitted after the
//! cluster stops. Callbacks capture only immutable identity (node id,
//! address); component state is read through snapshots.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use starling_core::MemberAddress;

use crate::kinds::ClusterKindRegistry;
use crate::types::MemberId;

/// One gauge sample set.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    /// The reporting member.
    pub member_id: MemberId,
    /// The reporting member's address.
    pub address: MemberAddress,
    /// `cluster.members.count`.
    pub members_count: usize,
    /// `cluster.virtual_actors.count`, per kind.
    pub virtual_actors: Vec<(String, u64)>,
}

type Observer = Arc<dyn Fn(&MetricsSnapshot) + Send + Sync>;

/// Gauge state plus observer registry for one cluster instance.
pub struct ClusterMetrics {
    member_id: MemberId,
    address: MemberAddress,
    registry: Arc<ClusterKindRegistry>,
    members_count: AtomicUsize,
    observers: Mutex<Vec<(u64, Observer)>>,
    next_id: AtomicU64,
    detached: AtomicBool,
}

impl ClusterMetrics {
    /// Create metrics for the given member.
    pub fn new(
        member_id: MemberId,
        address: MemberAddress,
        registry: Arc<ClusterKindRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            member_id,
            address,
            registry,
            members_count: AtomicUsize::new(0),
            observers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            detached: AtomicBool::new(false),
        })
    }

    /// Current gauge values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            member_id: self.member_id.clone(),
            address: self.address.clone(),
            members_count: self.members_count.load(Ordering::Relaxed),
            virtual_actors: self.registry.activation_counts(),
        }
    }

    /// Record the alive-member gauge and notify observers.
    ///
    /// Wired by the orchestrator as a topology subscriber.
    pub fn record_members_count(&self, count: usize) {
        self.members_count.store(count, Ordering::Relaxed);
        self.notify();
    }

    /// Push the current snapshot to every observer.
    pub fn notify(&self) {
        if self.detached.load(Ordering::SeqCst) {
            return;
        }
        let snapshot = self.snapshot();
        let observers: Vec<Observer> = {
            let guard = self.observers.lock().expect("metrics lock poisoned");
            guard.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        for observer in observers {
            observer(&snapshot);
        }
    }

    /// Register an observer callback. Returns a handle for deterministic
    /// unregistration.
    pub fn register_observer(
        self: &Arc<Self>,
        observer: impl Fn(&MetricsSnapshot) + Send + Sync + 'static,
    ) -> MetricsObserverHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers
            .lock()
            .expect("metrics lock poisoned")
            .push((id, Arc::new(observer)));
        MetricsObserverHandle {
            id,
            metrics: Arc::downgrade(self),
        }
    }

    /// Detach every observer. After this, no samples are emitted.
    pub fn detach_observers(&self) {
        self.detached.store(true, Ordering::SeqCst);
        self.observers
            .lock()
            .expect("metrics lock poisoned")
            .clear();
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.observers.lock().expect("metrics lock poisoned").len()
    }
}

/// Handle to one registered observer.
#[must_use = "dropping the handle unregisters the observer"]
pub struct MetricsObserverHandle {
    id: u64,
    metrics: Weak<ClusterMetrics>,
}

impl MetricsObserverHandle {
    /// Unregister the observer.
    pub fn unregister(self) {
        // Drop does the work.
    }
}

impl Drop for MetricsObserverHandle {
    fn drop(&mut self) {
        if let Some(metrics) = self.metrics.upgrade() {
            metrics
                .observers
                .lock()
                .expect("metrics lock poisoned")
                .retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds::{ClusterKind, TopicGrain};

    fn metrics() -> (Arc<ClusterMetrics>, ClusterKind) {
        let kind = ClusterKind::new("counter", Arc::new(|| Box::new(TopicGrain::default())));
        let registry = Arc::new(ClusterKindRegistry::build(vec![kind.clone()], true));
        let metrics = ClusterMetrics::new(
            MemberId::new("m1"),
            MemberAddress::new("127.0.0.1", 4020),
            registry,
        );
        (metrics, kind)
    }

    #[test]
    fn test_snapshot_reflects_gauges() {
        let (metrics, kind) = metrics();
        metrics.record_members_count(3);
        kind.record_activated();
        kind.record_activated();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.members_count, 3);
        assert_eq!(snapshot.virtual_actors, vec![("counter".to_string(), 2)]);
        assert_eq!(snapshot.member_id, MemberId::new("m1"));
    }

    #[test]
    fn test_observers_receive_samples() {
        let (metrics, _kind) = metrics();
        let samples = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&samples);
        let _handle = metrics.register_observer(move |snapshot| {
            sink.lock().expect("sink").push(snapshot.members_count);
        });

        metrics.record_members_count(2);
        metrics.record_members_count(5);
        assert_eq!(*samples.lock().expect("sink"), vec![2, 5]);
    }

    #[test]
    fn test_detach_stops_samples() {
        let (metrics, _kind) = metrics();
        let samples = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&samples);
        let _handle = metrics.register_observer(move |snapshot| {
            sink.lock().expect("sink").push(snapshot.members_count);
        });

        metrics.record_members_count(2);
        metrics.detach_observers();
        metrics.record_members_count(9);

        assert_eq!(*samples.lock().expect("sink"), vec![2]);
        assert_eq!(metrics.observer_count(), 0);
    }

    #[test]
    fn test_handle_drop_unregisters() {
        let (metrics, _kind) = metrics();
        {
            let _handle = metrics.register_observer(|_| {});
            assert_eq!(metrics.observer_count(), 1);
        }
        assert_eq!(metrics.observer_count(), 0);
    }
}
