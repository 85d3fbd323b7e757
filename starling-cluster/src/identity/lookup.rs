//! Identity lookup: resolve a [`ClusterIdentity`] to the location of its
//! single active owner, activating on demand.
//!
//! ## Placement algorithm
//!
//! ```text
//! get(identity)
//!   │ 1. local ownership cache (activations this member already hosts)
//!   │ 2. rendezvous-hash the owner candidate over members hosting the kind
//!   ├─ 3a. candidate is us: reserve in the store (CAS), spawn, return
//!   └─ 3b. candidate is a peer: forward an Activate request to it
//! ```
//!
//! The store arbitrates races: concurrent `get`s for the same identity on
//! any number of nodes collapse to the winner's location. Losing the CAS is
//! not an error; the caller gets the winner's pid.
//!
//! Placement survives churn: an existing activation stays valid until its
//! owner leaves (reservation TTL expiry) or it is deliberately passivated.
//! The hash-derived candidate is only consulted for *new* placements, so the
//! candidate and the actual owner may legitimately differ after a topology
//! change.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use starling_core::{MemberAddress, Providers, RandomProvider, TaskProvider, TimeProvider};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::rendezvous::select_owner;
use super::store::{AcquireOutcome, IdentityStore, StoreError};
use crate::activation::LocalActivations;
use crate::error::ClusterError;
use crate::kinds::ClusterKindRegistry;
use crate::member_list::MemberList;
use crate::transport::{ClusterMessage, ClusterTransport, TransportError};
use crate::types::{ClusterIdentity, Pid};

/// Resolves identities to activation locations.
///
/// The single contract shared by every lookup realization (store-backed,
/// partition-hash, ...). `setup` runs once before `get` traffic begins;
/// `shutdown` releases locally owned reservations when graceful.
#[async_trait]
pub trait IdentityLookup: Send + Sync {
    /// Prepare the lookup for the given hosted kinds.
    async fn setup(&self, kinds: &[String], is_client: bool) -> Result<(), ClusterError>;

    /// Resolve the identity, activating it somewhere if needed.
    async fn get(
        &self,
        identity: &ClusterIdentity,
        cancel: &CancellationToken,
    ) -> Result<Pid, ClusterError>;

    /// Tear down. Graceful shutdown releases all local reservations.
    async fn shutdown(&self, graceful: bool) -> Result<(), ClusterError>;
}

/// Retry shape for lookup operations.
#[derive(Debug, Clone)]
pub struct LookupConfig {
    /// Reservation TTL written on acquire and maintained by refresh.
    pub reservation_ttl: Duration,
    /// Timeout for forwarded activation requests.
    pub request_timeout: Duration,
    /// Attempts before a transient failure surfaces.
    pub max_attempts: usize,
    /// Base backoff between attempts (exponential, jittered).
    pub retry_backoff: Duration,
}

/// Store-backed lookup realization.
pub struct StoreIdentityLookup<P: Providers> {
    providers: P,
    config: LookupConfig,
    store: Arc<dyn IdentityStore>,
    member_list: Arc<MemberList>,
    registry: Arc<ClusterKindRegistry>,
    activations: Arc<LocalActivations<P>>,
    transport: Arc<dyn ClusterTransport>,
    local_address: MemberAddress,
    is_client: AtomicBool,
    shutting_down: AtomicBool,
    shutdown: CancellationToken,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    /// Serializes local placements. The store CAS arbitrates across nodes;
    /// this lock arbitrates between concurrent placers on the same node so
    /// a reservation and its activation never diverge.
    placement_lock: tokio::sync::Mutex<()>,
}

impl<P: Providers> StoreIdentityLookup<P> {
    /// Create a lookup bound to this member's components.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        providers: P,
        config: LookupConfig,
        store: Arc<dyn IdentityStore>,
        member_list: Arc<MemberList>,
        registry: Arc<ClusterKindRegistry>,
        activations: Arc<LocalActivations<P>>,
        transport: Arc<dyn ClusterTransport>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let local_address = member_list.local().address.clone();
        Arc::new(Self {
            providers,
            config,
            store,
            member_list,
            registry,
            activations,
            transport,
            local_address,
            is_client: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            shutdown,
            refresh_task: Mutex::new(None),
            placement_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Place `identity` on this member, or learn who already owns it.
    ///
    /// Runs on the hash-selected owner: either a local `get` selected us,
    /// or a peer forwarded an `Activate` request here.
    pub async fn place_local(
        &self,
        identity: &ClusterIdentity,
        cancel: &CancellationToken,
    ) -> Result<Pid, ClusterError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ClusterError::Unavailable);
        }
        let kind = self.registry.get(identity.kind())?;

        let _placement = self.placement_lock.lock().await;
        if let Some(pid) = self.activations.pid_of(identity) {
            return Ok(pid);
        }

        // Reserve first, spawn second: the store record must exist before
        // the grain runs.
        let local_id = self.activations.allocate_local_id(identity);
        let candidate = Pid::new(self.local_address.clone(), local_id);
        let mut outcome = self
            .store
            .try_acquire(identity, &candidate, self.config.reservation_ttl, cancel)
            .await
            .map_err(map_store_error)?;

        if let AcquireOutcome::HeldBy(owner) = &outcome
            && owner.address == self.local_address
        {
            // A reservation of ours with no live activation behind it: the
            // grain was passivated. Reclaim instead of dead-lettering until
            // the TTL expires.
            debug!(identity = %identity, stale = %owner, "reclaiming orphaned local reservation");
            let _ = self.store.release(identity, owner).await;
            outcome = self
                .store
                .try_acquire(identity, &candidate, self.config.reservation_ttl, cancel)
                .await
                .map_err(map_store_error)?;
        }

        match outcome {
            AcquireOutcome::HeldBy(owner) => Ok(owner),
            AcquireOutcome::Acquired => {
                if cancel.is_cancelled() {
                    // Cancelled between reservation and spawn: roll back so
                    // no dangling reservation survives the call.
                    let _ = self.store.release(identity, &candidate).await;
                    return Err(ClusterError::Cancelled);
                }
                let pid =
                    self.activations
                        .activate_with_local_id(identity, kind, candidate.local_id);
                info!(identity = %identity, pid = %pid, "activated identity locally");
                Ok(pid)
            }
        }
    }

    async fn forward(
        &self,
        owner_address: &MemberAddress,
        identity: &ClusterIdentity,
    ) -> Result<Pid, ClusterError> {
        let request = ClusterMessage::Activate {
            identity: identity.clone(),
        };
        let reply = self
            .transport
            .request(owner_address, request, self.config.request_timeout)
            .await;
        match reply {
            Ok(ClusterMessage::ActivateOk { pid }) => Ok(pid),
            Ok(ClusterMessage::ActivateFailed { reason }) => Err(ClusterError::Transient(reason)),
            Ok(other) => Err(ClusterError::Transient(format!(
                "unexpected activation reply: {other:?}"
            ))),
            Err(TransportError::Timeout) => Err(ClusterError::Timeout),
            Err(error) => Err(ClusterError::Transient(error.to_string())),
        }
    }

    async fn backoff(&self, attempt: usize) {
        let base = self.config.retry_backoff.saturating_mul(1 << attempt.min(8));
        let jitter = 0.5 + self.providers.random().jitter();
        let delay = base.mul_f64(jitter);
        self.providers.time().sleep(delay).await;
    }

    fn spawn_refresh_loop(&self) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let activations = Arc::clone(&self.activations);
        let time = self.providers.time().clone();
        let ttl = self.config.reservation_ttl;
        let interval = ttl / 2;
        let shutdown = self.shutdown.clone();
        self.providers
            .task()
            .spawn_task("reservation-refresh", async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = time.sleep(interval) => {}
                    }
                    for identity in activations.identities() {
                        let Some(pid) = activations.pid_of(&identity) else {
                            continue;
                        };
                        if let Err(error) = store.refresh(&identity, &pid, ttl).await {
                            // Next round retries; TTL gives us slack.
                            warn!(identity = %identity, %error, "reservation refresh failed");
                        }
                    }
                }
            })
    }
}

#[async_trait]
impl<P: Providers> IdentityLookup for StoreIdentityLookup<P> {
    async fn setup(&self, kinds: &[String], is_client: bool) -> Result<(), ClusterError> {
        self.is_client.store(is_client, Ordering::SeqCst);
        debug!(?kinds, is_client, "identity lookup ready");
        if !is_client {
            let handle = self.spawn_refresh_loop();
            *self
                .refresh_task
                .lock()
                .expect("refresh task lock poisoned") = Some(handle);
        }
        Ok(())
    }

    async fn get(
        &self,
        identity: &ClusterIdentity,
        cancel: &CancellationToken,
    ) -> Result<Pid, ClusterError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ClusterError::Unavailable);
        }

        let mut last_error = ClusterError::Timeout;
        for attempt in 0..self.config.max_attempts {
            if cancel.is_cancelled() {
                return Err(ClusterError::Cancelled);
            }

            // Local ownership cache: identities we already host stay put.
            if let Some(pid) = self.activations.pid_of(identity) {
                return Ok(pid);
            }

            let topology = self.member_list.current();
            if topology.members.is_empty() {
                last_error = ClusterError::Transient("no alive members".to_string());
                self.backoff(attempt).await;
                continue;
            }
            let candidates = topology.members_for_kind(identity.kind());
            if candidates.is_empty() {
                // Nobody in the cluster hosts this kind: invalid argument,
                // not a transient condition.
                return Err(ClusterError::UnknownKind(identity.kind().to_string()));
            }
            let owner = select_owner(&candidates, identity)
                .expect("non-empty candidate set always yields an owner");

            let is_local = !self.is_client.load(Ordering::SeqCst)
                && owner.id == self.member_list.local().id;
            let owner_address = owner.address.clone();
            let result = if is_local {
                self.place_local(identity, cancel).await
            } else {
                self.forward(&owner_address, identity).await
            };

            match result {
                Ok(pid) => return Ok(pid),
                Err(error @ (ClusterError::Cancelled | ClusterError::UnknownKind(_))) => {
                    return Err(error);
                }
                Err(error) => {
                    debug!(identity = %identity, attempt, %error, "lookup attempt failed");
                    last_error = error;
                    self.backoff(attempt).await;
                }
            }
        }
        Err(last_error)
    }

    async fn shutdown(&self, graceful: bool) -> Result<(), ClusterError> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let handle = self
            .refresh_task
            .lock()
            .expect("refresh task lock poisoned")
            .take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        if graceful {
            let released = self
                .store
                .release_all(&self.local_address)
                .await
                .map_err(map_store_error)?;
            info!(released, "released local identity reservations");
        }
        Ok(())
    }
}

fn map_store_error(error: StoreError) -> ClusterError {
    match error {
        StoreError::Cancelled => ClusterError::Cancelled,
        StoreError::Unavailable(message) => ClusterError::Store(message),
    }
}
