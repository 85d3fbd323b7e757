//! Cluster lifecycle orchestration.
//!
//! The [`Cluster`] owns every component and wires them together at startup:
//!
//! 1. build the kind registry (built-ins included for non-clients)
//! 2. start the remote transport with the cluster's message handler
//! 3. build the member list and subscribe cache eviction to topology events
//! 4. build the cluster context
//! 5. set up the identity lookup with the registered kinds
//! 6. bring up the local activation host
//! 7. pub/sub anchor (the built-in topic kind) is ready with the registry
//! 8. start the gossiper and seed its consensus generation
//! 9. start the provider in member or client mode
//! 10. await the member list's started signal
//!
//! Shutdown runs in reverse, honoring the graceful flag: announce
//! `cluster:left` and wait two gossip intervals (graceful only), detach
//! metric observers, drain local activations, stop the gossiper, release
//! identity reservations (graceful only), stop the provider, stop the
//! transport, dispose event subscriptions, and finally cancel the root
//! token that owns every background loop.
//!
//! Ownership is strictly tree-shaped: the cluster owns components,
//! subscriptions are opaque handles disposed before components drop, and
//! background loops hold weak references only.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use starling_core::{Providers, RandomProvider, TaskProvider, TimeProvider};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::activation::LocalActivations;
use crate::config::ClusterConfig;
use crate::context::{ClusterContext, RequestConfig};
use crate::error::ClusterError;
use crate::events::{ClusterEvent, EventBus, Subscription};
use crate::gossip::{GossipConfig, Gossiper};
use crate::identity::{IdentityLookup, LookupConfig, StoreIdentityLookup};
use crate::kinds::ClusterKindRegistry;
use crate::member_list::MemberList;
use crate::metrics::ClusterMetrics;
use crate::pid_cache::PidCache;
use crate::provider::{ClusterProvider, ProviderHandle};
use crate::transport::{ClusterMessage, ClusterTransport, RemoteHandler};
use crate::types::{Member, MemberId};

/// A running cluster member (or client).
pub struct Cluster<P: Providers> {
    providers: P,
    config: ClusterConfig,
    local_member: Member,
    is_client: bool,
    registry: Arc<ClusterKindRegistry>,
    event_bus: Arc<EventBus>,
    member_list: Arc<MemberList>,
    pid_cache: Arc<PidCache>,
    activations: Arc<LocalActivations<P>>,
    gossiper: Arc<Gossiper<P>>,
    lookup: Arc<StoreIdentityLookup<P>>,
    context: Arc<ClusterContext<P>>,
    metrics: Arc<ClusterMetrics>,
    provider: Arc<dyn ClusterProvider>,
    transport: Arc<dyn ClusterTransport>,
    shutdown_root: CancellationToken,
    subscriptions: Mutex<Vec<Subscription>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

/// Dispatches inbound transport messages to the owning components.
struct ClusterRemoteHandler<P: Providers> {
    gossiper: Arc<Gossiper<P>>,
    lookup: Arc<StoreIdentityLookup<P>>,
    activations: Arc<LocalActivations<P>>,
}

#[async_trait]
impl<P: Providers> RemoteHandler for ClusterRemoteHandler<P> {
    async fn handle(&self, message: ClusterMessage) -> Option<ClusterMessage> {
        match message {
            ClusterMessage::GossipPull { clock, .. } => {
                let (entries, truncated) = self.gossiper.handle_pull(&clock);
                Some(ClusterMessage::GossipDelta { entries, truncated })
            }
            ClusterMessage::GossipPush { entries } => {
                self.gossiper.handle_push(entries);
                None
            }
            ClusterMessage::Activate { identity } => {
                let cancel = CancellationToken::new();
                Some(match self.lookup.place_local(&identity, &cancel).await {
                    Ok(pid) => ClusterMessage::ActivateOk { pid },
                    Err(error) => ClusterMessage::ActivateFailed {
                        reason: error.to_string(),
                    },
                })
            }
            ClusterMessage::GrainRequest {
                identity,
                local_id,
                method,
                payload,
            } => match self
                .activations
                .invoke(&identity, &local_id, &method, payload)
                .await
            {
                Ok(bytes) => Some(ClusterMessage::GrainResponse { result: Ok(bytes) }),
                // Stale location: no reply resolves to a dead letter, which
                // tells the caller to re-resolve.
                Err(crate::activation::InvokeError::NotActive) => None,
                Err(error) => Some(ClusterMessage::GrainResponse {
                    result: Err(error.to_string()),
                }),
            },
            _ => None,
        }
    }
}

impl<P: Providers> Cluster<P> {
    /// Start a hosting member.
    pub async fn start_member(
        config: ClusterConfig,
        providers: P,
    ) -> Result<Arc<Self>, ClusterError> {
        Self::start(config, providers, false).await
    }

    /// Start a non-hosting client.
    pub async fn start_client(
        config: ClusterConfig,
        providers: P,
    ) -> Result<Arc<Self>, ClusterError> {
        Self::start(config, providers, true).await
    }

    async fn start(
        config: ClusterConfig,
        providers: P,
        is_client: bool,
    ) -> Result<Arc<Self>, ClusterError> {
        config.validate()?;
        let (Some(provider), Some(store), Some(transport)) = (
            config.provider.clone(),
            config.identity_store.clone(),
            config.transport.clone(),
        ) else {
            return Err(ClusterError::Configuration(
                "validated configuration lost a back-end".into(),
            ));
        };

        // Member ids are random and never reused: a restart joins as a new
        // member.
        let member_id = MemberId::new(format!("{:016x}", providers.random().next_u64()));
        let shutdown_root = CancellationToken::new();

        // Step 1: kind registry (built-in topic kind for non-clients).
        let registry = Arc::new(ClusterKindRegistry::build(config.kinds.clone(), is_client));
        let kinds = if is_client {
            Vec::new()
        } else {
            registry.names()
        };
        let local_member = Member::new(member_id.clone(), config.local_address(), kinds);
        info!(member_id = %member_id, address = %local_member.address, is_client, "starting cluster");

        let event_bus = EventBus::new();
        let member_list = MemberList::new(local_member.clone(), is_client, Arc::clone(&event_bus));
        let pid_cache = PidCache::new();
        let activations = Arc::new(LocalActivations::new(
            providers.clone(),
            local_member.address.clone(),
        ));
        let metrics = ClusterMetrics::new(
            member_id.clone(),
            local_member.address.clone(),
            Arc::clone(&registry),
        );

        let gossiper = Gossiper::new(
            providers.clone(),
            GossipConfig {
                interval: config.gossip_interval,
                fan_out: config.gossip_fan_out,
                max_delta_entries: config.gossip_max_delta_entries,
                suspect_threshold: config.gossip_suspect_threshold,
            },
            Arc::clone(&member_list),
            Arc::clone(&transport),
            Arc::clone(&event_bus),
            shutdown_root.child_token(),
        );
        let lookup = StoreIdentityLookup::new(
            providers.clone(),
            LookupConfig {
                reservation_ttl: config.reservation_ttl,
                request_timeout: config.request_timeout,
                max_attempts: config.max_request_retries,
                retry_backoff: config.retry_backoff,
            },
            Arc::clone(&store),
            Arc::clone(&member_list),
            Arc::clone(&registry),
            Arc::clone(&activations),
            Arc::clone(&transport),
            shutdown_root.child_token(),
        );

        // Step 4: the request context.
        let context = ClusterContext::new(
            providers.clone(),
            RequestConfig {
                timeout: config.request_timeout,
                max_retries: config.max_request_retries,
                retry_backoff: config.retry_backoff,
            },
            Arc::clone(&pid_cache),
            Arc::clone(&lookup) as Arc<dyn IdentityLookup>,
            Arc::clone(&transport),
            shutdown_root.clone(),
        );

        // Step 3: topology subscriptions. Cache eviction is registered
        // first so departed members are evicted before anything else reacts
        // to the same snapshot.
        let mut subscriptions = Vec::new();
        {
            let cache = Arc::clone(&pid_cache);
            subscriptions.push(event_bus.subscribe(move |event| {
                if let ClusterEvent::TopologyChanged(topology) = event {
                    for member in &topology.left {
                        cache.remove_by_member(&member.address);
                    }
                }
            }));
        }
        {
            let gossiper = Arc::clone(&gossiper);
            subscriptions.push(event_bus.subscribe(move |event| {
                if let ClusterEvent::TopologyChanged(topology) = event {
                    gossiper.on_topology(topology);
                }
            }));
        }
        {
            let metrics = Arc::clone(&metrics);
            subscriptions.push(event_bus.subscribe(move |event| {
                if let ClusterEvent::TopologyChanged(topology) = event {
                    metrics.record_members_count(topology.members.len());
                }
            }));
        }

        // Step 2: transport up, handler wired.
        let handler: Arc<dyn RemoteHandler> = Arc::new(ClusterRemoteHandler {
            gossiper: Arc::clone(&gossiper),
            lookup: Arc::clone(&lookup),
            activations: Arc::clone(&activations),
        });
        transport
            .start(handler)
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))?;

        // Step 5: identity lookup. Steps 6 and 7, the activation host and
        // the pub/sub topic kind, are ready with the registry.
        lookup.setup(&member_list.local().kinds, is_client).await?;

        // Step 8: gossip, with the consensus generation seeded from the
        // current (possibly still empty) topology.
        gossiper.start();
        {
            let topology = member_list.current();
            gossiper.on_topology(&topology);
        }

        // Step 9: the provider begins feeding membership.
        let provider_handle =
            ProviderHandle::new(local_member.clone(), Arc::clone(&member_list));
        if is_client {
            provider.start_client(provider_handle).await?;
        } else {
            provider.start_member(provider_handle).await?;
        }

        // Step 10: traffic only after self-awareness.
        let time = providers.time();
        let started = if is_client {
            time.timeout(config.startup_timeout, member_list.wait_first_update())
                .await
        } else {
            time.timeout(config.startup_timeout, member_list.wait_started())
                .await
        };
        if started.is_err() {
            error!("startup timed out waiting for membership");
            let _ = provider.shutdown(false).await;
            let _ = transport.stop().await;
            shutdown_root.cancel();
            return Err(ClusterError::Timeout);
        }

        let cluster = Arc::new(Self {
            providers: providers.clone(),
            local_member,
            is_client,
            registry,
            event_bus,
            member_list,
            pid_cache: Arc::clone(&pid_cache),
            activations,
            gossiper,
            lookup,
            context,
            metrics,
            provider,
            transport,
            shutdown_root: shutdown_root.clone(),
            subscriptions: Mutex::new(subscriptions),
            background: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
            config,
        });

        let mut background = Vec::new();
        if cluster.config.pid_cache_cleanup_enabled() {
            background.push(pid_cache.spawn_cleanup(
                &providers,
                cluster.config.pid_cache_clear_interval,
                cluster.config.pid_cache_ttl,
                shutdown_root.child_token(),
            ));
        }
        if !is_client {
            background.push(cluster.spawn_self_fencing_monitor());
        }
        *cluster
            .background
            .lock()
            .expect("background tasks lock poisoned") = background;

        info!(member_id = %cluster.local_member.id, "cluster started");
        Ok(cluster)
    }

    /// Watchdog for the self-fencing rule: a member the provider stops
    /// reporting must shut itself down rather than risk split ownership.
    fn spawn_self_fencing_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let time = self.providers.time().clone();
        let task = self.providers.task().clone();
        let timeout = self.config.member_health_timeout;
        let check_interval = (timeout / 4).max(std::time::Duration::from_millis(50));
        let shutdown = self.shutdown_root.child_token();
        self.providers
            .task()
            .spawn_task("self-fencing-monitor", async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = time.sleep(check_interval) => {}
                    }
                    let Some(cluster) = weak.upgrade() else { break };
                    if !cluster.member_list.check_self_health(time.now(), timeout) {
                        warn!("local member fenced, forcing abrupt shutdown");
                        // Shut down from a detached task: this loop is one
                        // of the background tasks shutdown joins.
                        task.spawn_task("fenced-shutdown", async move {
                            if let Err(error) =
                                cluster.shutdown(false, "member fenced").await
                            {
                                error!(%error, "fenced shutdown failed");
                            }
                        });
                        break;
                    }
                }
            })
    }

    /// Shut the cluster down.
    ///
    /// Graceful shutdown announces departure through gossip and releases
    /// identity reservations; abrupt shutdown skips both and trusts the
    /// provider's and store's TTLs to reap the member's state. Idempotent.
    pub async fn shutdown(&self, graceful: bool, reason: &str) -> Result<(), ClusterError> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(member_id = %self.local_member.id, graceful, reason, "shutting down cluster");

        // Operations initiated from here on fail fast with Unavailable, and
        // every background loop winds down.
        self.shutdown_root.cancel();

        // Steps 1-2: announce departure and give it two gossip intervals.
        if graceful && !self.is_client {
            self.gossiper.announce_left(reason).await;
        }

        // Step 3: no metric samples past this point.
        self.metrics.detach_observers();

        // Step 4: stop hosting grains.
        self.activations.drain();

        // Step 5: gossip down.
        self.gossiper.stop().await;

        // Step 6: reservations (graceful only; abrupt relies on TTL).
        if let Err(error) = self.lookup.shutdown(graceful).await {
            warn!(%error, "identity lookup shutdown failed");
        }

        // Step 7: leave the provider.
        self.provider.shutdown(graceful).await?;

        // Step 8: transport down.
        self.transport
            .stop()
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))?;

        // Subscriptions go before the components they reference.
        for subscription in self
            .subscriptions
            .lock()
            .expect("subscriptions lock poisoned")
            .drain(..)
        {
            subscription.dispose();
        }

        let background: Vec<JoinHandle<()>> = self
            .background
            .lock()
            .expect("background tasks lock poisoned")
            .drain(..)
            .collect();
        for handle in background {
            let _ = handle.await;
        }

        info!(member_id = %self.local_member.id, "cluster stopped");
        Ok(())
    }

    /// The request context.
    pub fn context(&self) -> &Arc<ClusterContext<P>> {
        &self.context
    }

    /// The gossiper.
    pub fn gossiper(&self) -> &Arc<Gossiper<P>> {
        &self.gossiper
    }

    /// The member list.
    pub fn member_list(&self) -> &Arc<MemberList> {
        &self.member_list
    }

    /// The PID cache.
    pub fn pid_cache(&self) -> &Arc<PidCache> {
        &self.pid_cache
    }

    /// Cluster metrics.
    pub fn metrics(&self) -> &Arc<ClusterMetrics> {
        &self.metrics
    }

    /// The kind registry.
    pub fn registry(&self) -> &Arc<ClusterKindRegistry> {
        &self.registry
    }

    /// The local member descriptor.
    pub fn local_member(&self) -> &Member {
        &self.local_member
    }

    /// The event bus (topology, consensus, departure events).
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Local activations host. Exposed for tests and embedding runtimes.
    pub fn activations(&self) -> &Arc<LocalActivations<P>> {
        &self.activations
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}
