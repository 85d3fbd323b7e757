//! # starling-cluster
//!
//! The cluster core of a virtual-actor runtime: logically named grains
//! (each a `(kind, identity)` pair) are transparently activated on exactly
//! one member of a dynamic cluster and addressed by name rather than by
//! physical location.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      Cluster (orchestrator)               │
//! │   owns components, wires subscriptions, start/shutdown    │
//! └──────┬──────────┬───────────┬──────────────┬─────────────┘
//!        │          │           │              │
//!        ▼          ▼           ▼              ▼
//! ┌───────────┐ ┌─────────┐ ┌──────────────┐ ┌────────────┐
//! │ MemberList│ │ Gossiper│ │IdentityLookup│ │ PidCache   │
//! │ topology  │ │ state + │ │ place / find │ │ id → pid   │
//! │ snapshots │ │consensus│ │ activations  │ │ + eviction │
//! └─────┬─────┘ └────┬────┘ └──────┬───────┘ └─────┬──────┘
//!       │ TopologyChanged (synchronous event bus)   │
//!       └────────────┴─────────────┴────────────────┘
//! ```
//!
//! The provider feeds raw member events into the member list, which
//! publishes topology snapshots; the gossiper consumes them (peer picking,
//! consensus generations) and produces its own state broadcasts; the
//! identity lookup places grains against the current topology; the PID
//! cache evicts entries for departed members before a topology publication
//! completes; the context resolves through cache-then-lookup and retries
//! across re-placements.
//!
//! ## Crate Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`types`] | `Member`, `ClusterTopology`, `ClusterIdentity`, `Pid` |
//! | [`config`] | `ClusterConfig` knobs and pluggable back-ends |
//! | [`events`] | Synchronous event bus and subscription handles |
//! | [`member_list`] | Authoritative membership view |
//! | [`gossip`] | Versioned state, anti-entropy loop, consensus checks |
//! | [`identity`] | Store contract, rendezvous selection, lookup |
//! | [`activation`] | `Grain` behavior trait and local hosting |
//! | [`pid_cache`] | Location cache with topology-driven eviction |
//! | [`context`] | Typed request/response over identities |
//! | [`kinds`] | Kind registry and the built-in topic kind |
//! | [`provider`] | Membership discovery contract + in-memory back-end |
//! | [`transport`] | Wire contract + in-process transport |
//! | [`metrics`] | Gauges and observer registration |
//! | [`cluster`] | The orchestrator |

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

pub mod activation;
pub mod cluster;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod gossip;
pub mod identity;
pub mod kinds;
pub mod member_list;
pub mod metrics;
pub mod pid_cache;
pub mod provider;
pub mod transport;
pub mod types;

pub use activation::{Grain, GrainError, LocalActivations};
pub use cluster::Cluster;
pub use config::ClusterConfig;
pub use context::ClusterContext;
pub use error::ClusterError;
pub use events::{ClusterEvent, EventBus, Subscription};
pub use gossip::{CLUSTER_LEFT_KEY, ConsensusHandle, ConsensusResult, Gossiper};
pub use identity::{
    AcquireOutcome, IdentityLookup, IdentityStore, InMemoryIdentityStore, StoreIdentityLookup,
};
pub use kinds::{ClusterKind, ClusterKindRegistry, GrainFactory, TOPIC_KIND};
pub use member_list::MemberList;
pub use metrics::{ClusterMetrics, MetricsSnapshot};
pub use pid_cache::{PidCache, PidCacheEntry};
pub use provider::{
    ClusterProvider, InMemoryClusterProvider, InMemoryDiscovery, InMemoryProviderConfig,
    ProviderHandle,
};
pub use transport::{
    ClusterMessage, ClusterTransport, InMemoryNetwork, InMemoryTransport, RemoteHandler,
    TransportError, decode_payload, encode_payload,
};
pub use types::{ClusterIdentity, ClusterTopology, Member, MemberId, MemberStatus, Pid};
