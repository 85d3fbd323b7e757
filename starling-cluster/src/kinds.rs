//! Catalog of grain kinds this member can host.
//!
//! The registry is built once at startup and immutable thereafter. On
//! non-client members a built-in [`TOPIC_KIND`] is registered automatically
//! (the pub/sub anchor) unless the user supplied their own kind with that
//! name.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::activation::{Grain, GrainError};
use crate::error::ClusterError;
use crate::types::Pid;

/// Name of the built-in pub/sub topic kind.
pub const TOPIC_KIND: &str = "topic";

/// Factory producing a fresh grain instance per activation.
pub type GrainFactory = Arc<dyn Fn() -> Box<dyn Grain> + Send + Sync>;

/// A grain kind: a name, a factory, and a live-activation counter.
#[derive(Clone)]
pub struct ClusterKind {
    name: String,
    factory: GrainFactory,
    activated: Arc<AtomicU64>,
}

impl ClusterKind {
    /// Define a kind with the given name and factory.
    pub fn new(name: impl Into<String>, factory: GrainFactory) -> Self {
        Self {
            name: name.into(),
            factory,
            activated: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The kind name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of activations of this kind currently hosted locally.
    pub fn activated_count(&self) -> u64 {
        self.activated.load(Ordering::Relaxed)
    }

    /// Build a fresh grain instance.
    pub fn build(&self) -> Box<dyn Grain> {
        (self.factory)()
    }

    pub(crate) fn record_activated(&self) {
        self.activated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_deactivated(&self) {
        // Saturating: drain and deactivate can race benignly in tests.
        let _ = self
            .activated
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }
}

impl std::fmt::Debug for ClusterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterKind")
            .field("name", &self.name)
            .field("activated", &self.activated_count())
            .finish()
    }
}

/// Immutable mapping from kind name to [`ClusterKind`].
#[derive(Debug)]
pub struct ClusterKindRegistry {
    kinds: HashMap<String, ClusterKind>,
}

impl ClusterKindRegistry {
    /// Build the registry from the configured kinds.
    ///
    /// Non-client members get the built-in topic kind unless the user
    /// supplied one with the same name.
    pub fn build(kinds: Vec<ClusterKind>, is_client: bool) -> Self {
        let mut map: HashMap<String, ClusterKind> = HashMap::new();
        for kind in kinds {
            map.insert(kind.name().to_string(), kind);
        }
        if !is_client && !map.contains_key(TOPIC_KIND) {
            map.insert(
                TOPIC_KIND.to_string(),
                ClusterKind::new(TOPIC_KIND, Arc::new(|| Box::new(TopicGrain::default()))),
            );
        }
        Self { kinds: map }
    }

    /// Get a kind, failing with [`ClusterError::UnknownKind`] when absent.
    pub fn get(&self, name: &str) -> Result<&ClusterKind, ClusterError> {
        self.kinds
            .get(name)
            .ok_or_else(|| ClusterError::UnknownKind(name.to_string()))
    }

    /// Get a kind if present.
    pub fn try_get(&self, name: &str) -> Option<&ClusterKind> {
        self.kinds.get(name)
    }

    /// All registered kind names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.kinds.keys().cloned().collect();
        names.sort();
        names
    }

    /// Live activation counts per kind, for the metric observers.
    pub fn activation_counts(&self) -> Vec<(String, u64)> {
        let mut counts: Vec<(String, u64)> = self
            .kinds
            .values()
            .map(|k| (k.name().to_string(), k.activated_count()))
            .collect();
        counts.sort();
        counts
    }
}

/// Built-in pub/sub anchor grain.
///
/// Maintains the subscriber set for one topic identity. Delivery fan-out is
/// layered above the core; the anchor only answers membership operations.
#[derive(Default)]
pub struct TopicGrain {
    subscribers: Vec<Pid>,
}

/// Payload for topic subscribe/unsubscribe operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSubscriber {
    /// The subscriber's location.
    pub pid: Pid,
}

#[async_trait]
impl Grain for TopicGrain {
    async fn handle(&mut self, method: &str, payload: &[u8]) -> Result<Vec<u8>, GrainError> {
        match method {
            "subscribe" => {
                let sub: TopicSubscriber = serde_json::from_slice(payload)
                    .map_err(|e| GrainError::Handler(e.to_string()))?;
                if !self.subscribers.contains(&sub.pid) {
                    self.subscribers.push(sub.pid);
                }
                Ok(Vec::new())
            }
            "unsubscribe" => {
                let sub: TopicSubscriber = serde_json::from_slice(payload)
                    .map_err(|e| GrainError::Handler(e.to_string()))?;
                self.subscribers.retain(|p| p != &sub.pid);
                Ok(Vec::new())
            }
            "subscribers" => serde_json::to_vec(&self.subscribers)
                .map_err(|e| GrainError::Handler(e.to_string())),
            other => Err(GrainError::UnknownMethod(other.to_string())),
        }
    }
}
