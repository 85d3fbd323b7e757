//! In-process event bus for cluster events.
//!
//! Publication is synchronous: `publish` invokes every subscriber on the
//! calling task before returning. The member list relies on this to
//! guarantee that PID-cache eviction for departed members completes before a
//! topology publication finishes.
//!
//! Subscriptions are returned as opaque [`Subscription`] handles holding only
//! a weak back-reference to the bus, so subscribers never keep the bus (or
//! the components owning it) alive. The orchestrator disposes all handles
//! during shutdown, before components are dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::types::{ClusterTopology, MemberId};

/// Events published by the cluster core.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    /// Membership changed; carries the full new snapshot.
    TopologyChanged(Arc<ClusterTopology>),
    /// A registered consensus check was satisfied for the given generation.
    ConsensusReached {
        /// Consensus generation (bumped on every alive-set change).
        generation: u64,
        /// The gossip key the check projects over.
        key: String,
    },
    /// A member announced `cluster:left` through gossip before departing.
    MemberLeftGracefully(MemberId),
}

type Callback = Arc<dyn Fn(&ClusterEvent) + Send + Sync>;

/// Synchronous publish/subscribe bus for [`ClusterEvent`]s.
pub struct EventBus {
    subscribers: Mutex<Vec<(u64, Callback)>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create a new bus.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Register a subscriber. The returned handle unsubscribes on
    /// [`Subscription::dispose`] or drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(&ClusterEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .push((id, Arc::new(callback)));
        Subscription {
            id,
            bus: Arc::downgrade(self),
        }
    }

    /// Deliver an event to every current subscriber, synchronously.
    ///
    /// Subscribers are invoked outside the registry lock so a callback may
    /// itself subscribe or dispose without deadlocking.
    pub fn publish(&self, event: &ClusterEvent) {
        let snapshot: Vec<Callback> = {
            let guard = self.subscribers.lock().expect("event bus lock poisoned");
            guard.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        for callback in snapshot {
            callback(event);
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .retain(|(sub_id, _)| *sub_id != id);
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .len()
    }
}

/// Opaque handle to an event-bus subscription.
#[must_use = "dropping the handle unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    bus: Weak<EventBus>,
}

impl Subscription {
    /// Remove the subscription from the bus.
    pub fn dispose(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h1 = hits.clone();
        let _s1 = bus.subscribe(move |_| {
            h1.fetch_add(1, Ordering::SeqCst);
        });
        let h2 = hits.clone();
        let _s2 = bus.subscribe(move |_| {
            h2.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&ClusterEvent::MemberLeftGracefully(MemberId::new("m1")));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_publish_is_synchronous() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let s = seen.clone();
        let _sub = bus.subscribe(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&ClusterEvent::MemberLeftGracefully(MemberId::new("m1")));
        // Visible on the publishing thread immediately after publish returns.
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispose_unsubscribes() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let sub = bus.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(bus.subscriber_count(), 1);

        sub.dispose();
        assert_eq!(bus.subscriber_count(), 0);

        bus.publish(&ClusterEvent::MemberLeftGracefully(MemberId::new("m1")));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus = EventBus::new();
        {
            let _sub = bus.subscribe(|_| {});
            assert_eq!(bus.subscriber_count(), 1);
        }
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_subscription_outlives_bus() {
        let bus = EventBus::new();
        let sub = bus.subscribe(|_| {});
        drop(bus);
        // Disposing after the bus is gone must not panic.
        sub.dispose();
    }
}
