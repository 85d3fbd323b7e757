//! Cluster configuration.
//!
//! ## Tuning Guidelines
//!
//! - `gossip_interval` drives anti-entropy cadence. Sub-second values give
//!   fast convergence (expected `O(log N · gossip_interval)`); the default
//!   300 ms matches typical deployments.
//! - `gossip_fan_out` peers are contacted per tick. 3 is enough for small
//!   and medium clusters; the gossiper clamps it to the alive peer count.
//! - `member_health_timeout` is the self-fencing threshold: if the provider
//!   stops reporting the local member for this long, the cluster shuts
//!   itself down rather than risk split ownership.
//! - `reservation_ttl` bounds how long a crashed member's placements stay in
//!   the identity store. The lookup refreshes its own reservations at half
//!   this interval.
//! - `pid_cache_clear_interval` / `pid_cache_ttl`: either set to zero
//!   disables time-based cache eviction (topology-driven eviction always
//!   runs).

use std::sync::Arc;
use std::time::Duration;

use starling_core::MemberAddress;

use crate::error::ClusterError;
use crate::identity::IdentityStore;
use crate::kinds::ClusterKind;
use crate::provider::ClusterProvider;
use crate::transport::ClusterTransport;

/// Configuration for a cluster member or client.
#[derive(Clone)]
pub struct ClusterConfig {
    /// Host peers use to reach this member.
    pub member_host: String,
    /// Port peers use to reach this member.
    pub member_port: u16,
    /// Cadence of anti-entropy gossip.
    pub gossip_interval: Duration,
    /// Peers contacted per gossip tick.
    pub gossip_fan_out: usize,
    /// Maximum `(member, key)` entries per gossip delta; larger deltas are
    /// paged across ticks.
    pub gossip_max_delta_entries: usize,
    /// Consecutive gossip failures before a peer is suspected and skipped.
    pub gossip_suspect_threshold: u32,
    /// Cadence of the PID cache cleanup task. Zero disables it.
    pub pid_cache_clear_interval: Duration,
    /// Idle TTL for PID cache entries. Zero disables cleanup.
    pub pid_cache_ttl: Duration,
    /// Self-fencing threshold: how long the provider may omit the local
    /// member from its reports before the cluster shuts down.
    pub member_health_timeout: Duration,
    /// TTL for identity-store reservations.
    pub reservation_ttl: Duration,
    /// Per-attempt timeout for cluster requests.
    pub request_timeout: Duration,
    /// Maximum attempts for a cluster request.
    pub max_request_retries: usize,
    /// Base backoff between retries (exponential, with jitter).
    pub retry_backoff: Duration,
    /// How long startup waits for the member list to see the local member.
    pub startup_timeout: Duration,

    pub(crate) kinds: Vec<ClusterKind>,
    pub(crate) provider: Option<Arc<dyn ClusterProvider>>,
    pub(crate) identity_store: Option<Arc<dyn IdentityStore>>,
    pub(crate) transport: Option<Arc<dyn ClusterTransport>>,
}

impl ClusterConfig {
    /// Create a configuration with production defaults.
    pub fn new(member_host: impl Into<String>, member_port: u16) -> Self {
        Self {
            member_host: member_host.into(),
            member_port,
            gossip_interval: Duration::from_millis(300),
            gossip_fan_out: 3,
            gossip_max_delta_entries: 64,
            gossip_suspect_threshold: 3,
            pid_cache_clear_interval: Duration::from_secs(30),
            pid_cache_ttl: Duration::from_secs(15 * 60),
            member_health_timeout: Duration::from_secs(10),
            reservation_ttl: Duration::from_secs(30),
            request_timeout: Duration::from_secs(5),
            max_request_retries: 3,
            retry_backoff: Duration::from_millis(50),
            startup_timeout: Duration::from_secs(10),
            kinds: Vec::new(),
            provider: None,
            identity_store: None,
            transport: None,
        }
    }

    /// Create a configuration with compressed timings for tests.
    pub fn for_testing(member_host: impl Into<String>, member_port: u16) -> Self {
        let mut config = Self::new(member_host, member_port);
        config.gossip_interval = Duration::from_millis(20);
        config.pid_cache_clear_interval = Duration::from_millis(25);
        config.member_health_timeout = Duration::from_secs(2);
        config.reservation_ttl = Duration::from_secs(2);
        config.request_timeout = Duration::from_secs(1);
        config.retry_backoff = Duration::from_millis(10);
        config.startup_timeout = Duration::from_secs(5);
        config
    }

    /// Register a grain kind.
    pub fn with_kind(mut self, kind: ClusterKind) -> Self {
        self.kinds.push(kind);
        self
    }

    /// Set the membership provider back-end.
    pub fn with_provider(mut self, provider: Arc<dyn ClusterProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Set the identity store back-end.
    pub fn with_identity_store(mut self, store: Arc<dyn IdentityStore>) -> Self {
        self.identity_store = Some(store);
        self
    }

    /// Set the remote transport.
    pub fn with_transport(mut self, transport: Arc<dyn ClusterTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Address peers use to reach this member.
    pub fn local_address(&self) -> MemberAddress {
        MemberAddress::new(self.member_host.clone(), self.member_port)
    }

    /// Whether the time-based PID cache cleanup task should run.
    pub fn pid_cache_cleanup_enabled(&self) -> bool {
        !self.pid_cache_clear_interval.is_zero() && !self.pid_cache_ttl.is_zero()
    }

    pub(crate) fn validate(&self) -> Result<(), ClusterError> {
        if self.member_host.is_empty() {
            return Err(ClusterError::Configuration("member host is empty".into()));
        }
        if self.gossip_interval.is_zero() {
            return Err(ClusterError::Configuration(
                "gossip interval must be positive".into(),
            ));
        }
        if self.gossip_fan_out == 0 {
            return Err(ClusterError::Configuration(
                "gossip fan-out must be at least 1".into(),
            ));
        }
        if self.provider.is_none() {
            return Err(ClusterError::Configuration(
                "no cluster provider registered".into(),
            ));
        }
        if self.identity_store.is_none() {
            return Err(ClusterError::Configuration(
                "no identity store registered".into(),
            ));
        }
        if self.transport.is_none() {
            return Err(ClusterError::Configuration(
                "no transport registered".into(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("member_host", &self.member_host)
            .field("member_port", &self.member_port)
            .field("gossip_interval", &self.gossip_interval)
            .field("gossip_fan_out", &self.gossip_fan_out)
            .field("kinds", &self.kinds.len())
            .field("provider", &self.provider.is_some())
            .field("identity_store", &self.identity_store.is_some())
            .field("transport", &self.transport.is_some())
            .finish()
    }
}
