//! Cluster provider contract and the in-process discovery back-end.
//!
//! A provider is the pluggable membership discovery back-end (Consul,
//! Kubernetes, a database, ...). It registers the local member, keeps its
//! registration fresh, and feeds the member list with the alive set it
//! observes. The core only consumes the contract.
//!
//! [`InMemoryClusterProvider`] is the single-process reference: members of a
//! test cluster share an [`InMemoryDiscovery`] hub where registrations carry
//! a TTL. Graceful shutdown deregisters immediately; abrupt shutdown simply
//! stops heartbeating and lets the TTL expire, which is exactly how a
//! crashed member disappears in production back-ends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use starling_core::{Providers, TaskProvider, TimeProvider};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::ClusterError;
use crate::member_list::MemberList;
use crate::types::{Member, MemberId};

/// Handle the orchestrator gives a provider: the local member descriptor
/// plus the sink for membership reports.
#[derive(Clone)]
pub struct ProviderHandle {
    local: Member,
    member_list: Arc<MemberList>,
}

impl ProviderHandle {
    /// Create a handle feeding the given member list.
    pub fn new(local: Member, member_list: Arc<MemberList>) -> Self {
        Self { local, member_list }
    }

    /// The member this handle belongs to.
    pub fn local_member(&self) -> &Member {
        &self.local
    }

    /// Deliver a full membership report observed at `now`.
    pub fn update_members(&self, members: Vec<Member>, now: Duration) {
        self.member_list.update_members(members, now);
    }
}

/// Pluggable membership discovery back-end.
#[async_trait]
pub trait ClusterProvider: Send + Sync {
    /// Join the cluster as a hosting member and start reporting membership.
    async fn start_member(&self, handle: ProviderHandle) -> Result<(), ClusterError>;

    /// Observe the cluster without joining it (client mode).
    async fn start_client(&self, handle: ProviderHandle) -> Result<(), ClusterError>;

    /// Leave the cluster. Graceful deregisters; abrupt relies on TTL expiry.
    /// Must be idempotent.
    async fn shutdown(&self, graceful: bool) -> Result<(), ClusterError>;
}

struct DiscoveryEntry {
    member: Member,
    expires_at: Duration,
}

/// Shared in-process discovery registry with TTL-bounded registrations.
#[derive(Default)]
pub struct InMemoryDiscovery {
    entries: Mutex<HashMap<MemberId, DiscoveryEntry>>,
}

impl InMemoryDiscovery {
    /// Create an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, member: Member, now: Duration, ttl: Duration) {
        self.entries
            .lock()
            .expect("discovery lock poisoned")
            .insert(
                member.id.clone(),
                DiscoveryEntry {
                    member,
                    expires_at: now + ttl,
                },
            );
    }

    fn heartbeat(&self, id: &MemberId, now: Duration, ttl: Duration) {
        if let Some(entry) = self
            .entries
            .lock()
            .expect("discovery lock poisoned")
            .get_mut(id)
        {
            entry.expires_at = now + ttl;
        }
    }

    fn deregister(&self, id: &MemberId) {
        self.entries
            .lock()
            .expect("discovery lock poisoned")
            .remove(id);
    }

    /// Members whose registration has not expired at `now`.
    pub fn alive(&self, now: Duration) -> Vec<Member> {
        self.entries
            .lock()
            .expect("discovery lock poisoned")
            .values()
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.member.clone())
            .collect()
    }
}

/// Timing knobs for the in-memory provider.
#[derive(Debug, Clone)]
pub struct InMemoryProviderConfig {
    /// Registration TTL.
    pub ttl: Duration,
    /// How often the provider refreshes its own registration.
    pub heartbeat_interval: Duration,
    /// How often the provider polls the registry and reports membership.
    pub poll_interval: Duration,
}

impl InMemoryProviderConfig {
    /// Compressed timings for tests.
    ///
    /// The TTL keeps a wide margin over the heartbeat interval: an expired
    /// registration blocks the member id forever, so a scheduler hiccup
    /// must not look like a death.
    pub fn for_testing() -> Self {
        Self {
            ttl: Duration::from_secs(1),
            heartbeat_interval: Duration::from_millis(100),
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl Default for InMemoryProviderConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(3),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// In-process provider over a shared [`InMemoryDiscovery`] hub.
pub struct InMemoryClusterProvider<P: Providers> {
    providers: P,
    discovery: Arc<InMemoryDiscovery>,
    config: InMemoryProviderConfig,
    stop: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    local_id: Mutex<Option<MemberId>>,
    shut_down: AtomicBool,
}

impl<P: Providers> InMemoryClusterProvider<P> {
    /// Create a provider on the shared hub.
    pub fn new(
        providers: P,
        discovery: Arc<InMemoryDiscovery>,
        config: InMemoryProviderConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            providers,
            discovery,
            config,
            stop: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            local_id: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        })
    }

    fn spawn_poll_loop(&self, handle: ProviderHandle) -> JoinHandle<()> {
        let discovery = Arc::clone(&self.discovery);
        let time = self.providers.time().clone();
        let interval = self.config.poll_interval;
        let stop = self.stop.clone();
        self.providers
            .task()
            .spawn_task("provider-poll", async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = time.sleep(interval) => {}
                    }
                    let now = time.now();
                    handle.update_members(discovery.alive(now), now);
                }
            })
    }

    fn spawn_heartbeat_loop(&self, id: MemberId) -> JoinHandle<()> {
        let discovery = Arc::clone(&self.discovery);
        let time = self.providers.time().clone();
        let interval = self.config.heartbeat_interval;
        let ttl = self.config.ttl;
        let stop = self.stop.clone();
        self.providers
            .task()
            .spawn_task("provider-heartbeat", async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = time.sleep(interval) => {}
                    }
                    discovery.heartbeat(&id, time.now(), ttl);
                }
            })
    }
}

#[async_trait]
impl<P: Providers> ClusterProvider for InMemoryClusterProvider<P> {
    async fn start_member(&self, handle: ProviderHandle) -> Result<(), ClusterError> {
        let local = handle.local_member().clone();
        info!(member_id = %local.id, "registering member with discovery");
        let now = self.providers.time().now();
        self.discovery.register(local.clone(), now, self.config.ttl);
        *self.local_id.lock().expect("provider lock poisoned") = Some(local.id.clone());

        let mut tasks = self.tasks.lock().expect("provider lock poisoned");
        tasks.push(self.spawn_heartbeat_loop(local.id));
        tasks.push(self.spawn_poll_loop(handle.clone()));

        // Seed the member list immediately rather than waiting one poll.
        let now = self.providers.time().now();
        handle.update_members(self.discovery.alive(now), now);
        Ok(())
    }

    async fn start_client(&self, handle: ProviderHandle) -> Result<(), ClusterError> {
        debug!("starting provider in client mode");
        let mut tasks = self.tasks.lock().expect("provider lock poisoned");
        tasks.push(self.spawn_poll_loop(handle.clone()));
        let now = self.providers.time().now();
        handle.update_members(self.discovery.alive(now), now);
        Ok(())
    }

    async fn shutdown(&self, graceful: bool) -> Result<(), ClusterError> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop.cancel();
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .expect("provider lock poisoned")
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
        if graceful
            && let Some(id) = self
                .local_id
                .lock()
                .expect("provider lock poisoned")
                .clone()
        {
            info!(member_id = %id, "deregistering member from discovery");
            self.discovery.deregister(&id);
        }
        Ok(())
    }
}
