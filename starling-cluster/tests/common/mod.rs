//! Shared harness for multi-member in-process clusters.
//!
//! Every member started through a [`TestHarness`] shares the same in-memory
//! network, discovery registry, and identity store, which is enough to
//! exercise the full placement/gossip/lifecycle machinery without sockets.

// Each integration binary uses a different slice of the harness.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use starling_cluster::{
    Cluster, ClusterConfig, ClusterKind, Grain, GrainError, InMemoryClusterProvider,
    InMemoryDiscovery, InMemoryIdentityStore, InMemoryNetwork, InMemoryProviderConfig,
    InMemoryTransport,
};
use starling_core::{TokioProviders, TokioTimeProvider};

/// A grain with a counter per identity; `increment` returns the new value,
/// `get` returns the current one.
pub struct CounterGrain {
    count: i64,
}

#[async_trait]
impl Grain for CounterGrain {
    async fn handle(&mut self, method: &str, _payload: &[u8]) -> Result<Vec<u8>, GrainError> {
        match method {
            "increment" => {
                self.count += 1;
                serde_json::to_vec(&self.count).map_err(|e| GrainError::Handler(e.to_string()))
            }
            "get" => serde_json::to_vec(&self.count)
                .map_err(|e| GrainError::Handler(e.to_string())),
            other => Err(GrainError::UnknownMethod(other.to_string())),
        }
    }
}

/// Counter kind registered on every harness member.
pub fn counter_kind() -> ClusterKind {
    ClusterKind::new("counter", Arc::new(|| Box::new(CounterGrain { count: 0 })))
}

/// Shared back-ends for one test cluster.
pub struct TestHarness {
    pub network: Arc<InMemoryNetwork>,
    pub discovery: Arc<InMemoryDiscovery>,
    pub store: Arc<InMemoryIdentityStore<TokioTimeProvider>>,
}

impl TestHarness {
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        Self {
            network: InMemoryNetwork::new(),
            discovery: InMemoryDiscovery::new(),
            store: Arc::new(InMemoryIdentityStore::new(TokioTimeProvider::new())),
        }
    }

    /// Base configuration for a member on `port`, wired to the shared
    /// back-ends.
    pub fn config(&self, port: u16) -> (ClusterConfig, TokioProviders) {
        let providers = TokioProviders::new();
        let address = starling_core::MemberAddress::new("127.0.0.1", port);
        let config = ClusterConfig::for_testing("127.0.0.1", port)
            .with_kind(counter_kind())
            .with_provider(InMemoryClusterProvider::new(
                providers.clone(),
                Arc::clone(&self.discovery),
                InMemoryProviderConfig::for_testing(),
            ))
            .with_identity_store(Arc::clone(&self.store) as Arc<dyn starling_cluster::IdentityStore>)
            .with_transport(InMemoryTransport::new(
                providers.clone(),
                Arc::clone(&self.network),
                address,
            ));
        (config, providers)
    }

    /// Start a hosting member on `port`.
    pub async fn start_member(&self, port: u16) -> Arc<Cluster<TokioProviders>> {
        let (config, providers) = self.config(port);
        Cluster::start_member(config, providers)
            .await
            .expect("member should start")
    }

    /// Start a member with a tweaked configuration.
    pub async fn start_member_with(
        &self,
        port: u16,
        tweak: impl FnOnce(&mut ClusterConfig),
    ) -> Arc<Cluster<TokioProviders>> {
        let (mut config, providers) = self.config(port);
        tweak(&mut config);
        Cluster::start_member(config, providers)
            .await
            .expect("member should start")
    }
}

/// Poll `check` until it returns true or `deadline` elapses.
pub async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) {
    let limit = std::time::Instant::now() + deadline;
    while !check() {
        assert!(
            std::time::Instant::now() < limit,
            "condition not reached within {deadline:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until every listed cluster sees exactly `count` members.
pub async fn wait_member_count(
    clusters: &[&Arc<Cluster<TokioProviders>>],
    count: usize,
    deadline: Duration,
) {
    for cluster in clusters {
        let cluster = Arc::clone(cluster);
        wait_until(deadline, || {
            cluster.member_list().current().members.len() == count
        })
        .await;
    }
}
