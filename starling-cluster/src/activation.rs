//! Local grain hosting: the seam between the cluster core and the actor
//! runtime that executes user code.
//!
//! The cluster core needs just enough hosting surface to place and drive
//! activations: a [`Grain`] behavior trait, one mailbox task per activation
//! (requests are processed serially, in arrival order), and the
//! [`LocalActivations`] registry tracking which identities this member
//! currently hosts.
//!
//! ## Activation lifecycle
//!
//! ```text
//! requested ──> reserved-in-store ──> spawned-locally ──> ready
//!                                                           │
//!                                              passivated / evicted
//! ```
//!
//! The reservation step happens in the identity lookup; this module covers
//! spawn-to-evict. A failure before `ready` requires the caller to release
//! the reservation.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use starling_core::{MemberAddress, Providers, TaskProvider};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::kinds::ClusterKind;
use crate::types::{ClusterIdentity, Pid};

/// Mailbox depth per activation. Senders back off when the mailbox is full.
const MAILBOX_CAPACITY: usize = 128;

/// Error returned by a grain handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GrainError {
    /// The grain does not implement the requested method.
    #[error("unknown method {0:?}")]
    UnknownMethod(String),
    /// The handler failed.
    #[error("{0}")]
    Handler(String),
}

/// Behavior of a virtual actor.
///
/// A grain receives requests one at a time; the hosting mailbox serializes
/// delivery, so `&mut self` is safe without internal locking.
#[async_trait]
pub trait Grain: Send + 'static {
    /// Handle one request and produce a response payload.
    async fn handle(&mut self, method: &str, payload: &[u8]) -> Result<Vec<u8>, GrainError>;
}

/// Failure modes when invoking a locally hosted activation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvokeError {
    /// No activation with that identity/local id is hosted here. The caller
    /// holds a stale pid and should re-resolve.
    #[error("activation not present")]
    NotActive,
    /// The activation's mailbox closed mid-request (evicted under us).
    #[error("activation stopped")]
    Stopped,
    /// The grain handler itself failed.
    #[error(transparent)]
    Grain(#[from] GrainError),
}

struct GrainJob {
    method: String,
    payload: Vec<u8>,
    reply: oneshot::Sender<Result<Vec<u8>, GrainError>>,
}

struct ActivationHandle {
    pid: Pid,
    kind: ClusterKind,
    mailbox: mpsc::Sender<GrainJob>,
}

/// Registry of grain activations hosted by this member.
pub struct LocalActivations<P: Providers> {
    providers: P,
    address: MemberAddress,
    entries: Mutex<HashMap<ClusterIdentity, ActivationHandle>>,
    next_local: AtomicU64,
}

impl<P: Providers> LocalActivations<P> {
    /// Create an empty registry for the given local address.
    pub fn new(providers: P, address: MemberAddress) -> Self {
        Self {
            providers,
            address,
            entries: Mutex::new(HashMap::new()),
            next_local: AtomicU64::new(1),
        }
    }

    /// Allocate the process-local id the next activation of `identity`
    /// would get.
    ///
    /// The identity lookup allocates the id up front so it can reserve the
    /// resulting pid in the store *before* spawning (the reservation
    /// precedes the spawn in the activation lifecycle).
    pub fn allocate_local_id(&self, identity: &ClusterIdentity) -> String {
        let n = self.next_local.fetch_add(1, Ordering::Relaxed);
        format!("{}${}", identity, n)
    }

    /// Spawn an activation for `identity` using the kind's factory, or
    /// return the existing pid if one is already hosted.
    pub fn activate(&self, identity: &ClusterIdentity, kind: &ClusterKind) -> Pid {
        let local_id = self.allocate_local_id(identity);
        self.activate_with_local_id(identity, kind, local_id)
    }

    /// Spawn an activation under a pre-allocated local id, or return the
    /// existing pid if one is already hosted.
    pub fn activate_with_local_id(
        &self,
        identity: &ClusterIdentity,
        kind: &ClusterKind,
        local_id: String,
    ) -> Pid {
        let mut entries = self.entries.lock().expect("activations lock poisoned");
        if let Some(existing) = entries.get(identity) {
            return existing.pid.clone();
        }

        let pid = Pid::new(self.address.clone(), local_id);

        let (tx, rx) = mpsc::channel::<GrainJob>(MAILBOX_CAPACITY);
        let mut grain = kind.build();
        let task_name = format!("grain/{}", identity);
        self.providers.task().spawn_task(&task_name, async move {
            let mut rx = rx;
            while let Some(job) = rx.recv().await {
                let result = grain.handle(&job.method, &job.payload).await;
                // Caller may have given up; nothing to do if the reply drops.
                let _ = job.reply.send(result);
            }
        });

        kind.record_activated();
        debug!(identity = %identity, pid = %pid, "activated grain");
        entries.insert(
            identity.clone(),
            ActivationHandle {
                pid: pid.clone(),
                kind: kind.clone(),
                mailbox: tx,
            },
        );
        pid
    }

    /// Pid of a locally hosted activation, if any.
    pub fn pid_of(&self, identity: &ClusterIdentity) -> Option<Pid> {
        self.entries
            .lock()
            .expect("activations lock poisoned")
            .get(identity)
            .map(|h| h.pid.clone())
    }

    /// Deliver one request to a hosted activation and await its response.
    ///
    /// `local_id` must match the hosted activation; a mismatch means the
    /// caller holds a pid from a previous incarnation.
    pub async fn invoke(
        &self,
        identity: &ClusterIdentity,
        local_id: &str,
        method: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, InvokeError> {
        let mailbox = {
            let entries = self.entries.lock().expect("activations lock poisoned");
            match entries.get(identity) {
                Some(handle) if handle.pid.local_id == local_id => handle.mailbox.clone(),
                _ => return Err(InvokeError::NotActive),
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        mailbox
            .send(GrainJob {
                method: method.to_string(),
                payload,
                reply: reply_tx,
            })
            .await
            .map_err(|_| InvokeError::Stopped)?;

        match reply_rx.await {
            Ok(result) => result.map_err(InvokeError::Grain),
            Err(_) => Err(InvokeError::Stopped),
        }
    }

    /// Evict one activation. Returns `true` if it was hosted here.
    ///
    /// Closing the mailbox lets in-flight requests finish before the task
    /// exits.
    pub fn deactivate(&self, identity: &ClusterIdentity) -> bool {
        let removed = self
            .entries
            .lock()
            .expect("activations lock poisoned")
            .remove(identity);
        match removed {
            Some(handle) => {
                handle.kind.record_deactivated();
                debug!(identity = %identity, "passivated grain");
                true
            }
            None => false,
        }
    }

    /// Evict every activation. Used during shutdown.
    pub fn drain(&self) -> usize {
        let drained: Vec<(ClusterIdentity, ActivationHandle)> = self
            .entries
            .lock()
            .expect("activations lock poisoned")
            .drain()
            .collect();
        let count = drained.len();
        for (identity, handle) in drained {
            handle.kind.record_deactivated();
            debug!(identity = %identity, "drained grain");
        }
        if count > 0 {
            warn!(count, "drained local activations");
        }
        count
    }

    /// All identities hosted here. Used to release reservations at shutdown.
    pub fn identities(&self) -> Vec<ClusterIdentity> {
        self.entries
            .lock()
            .expect("activations lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Number of hosted activations.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("activations lock poisoned").len()
    }

    /// Whether nothing is hosted here.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use starling_core::TokioProviders;
    use std::sync::Arc;

    struct EchoGrain;

    #[async_trait]
    impl Grain for EchoGrain {
        async fn handle(&mut self, method: &str, payload: &[u8]) -> Result<Vec<u8>, GrainError> {
            match method {
                "echo" => Ok(payload.to_vec()),
                other => Err(GrainError::UnknownMethod(other.to_string())),
            }
        }
    }

    struct CounterGrain {
        count: u64,
    }

    #[async_trait]
    impl Grain for CounterGrain {
        async fn handle(&mut self, method: &str, _payload: &[u8]) -> Result<Vec<u8>, GrainError> {
            match method {
                "increment" => {
                    self.count += 1;
                    Ok(self.count.to_string().into_bytes())
                }
                "get" => Ok(self.count.to_string().into_bytes()),
                other => Err(GrainError::UnknownMethod(other.to_string())),
            }
        }
    }

    fn echo_kind() -> ClusterKind {
        ClusterKind::new("echo", Arc::new(|| Box::new(EchoGrain)))
    }

    fn counter_kind() -> ClusterKind {
        ClusterKind::new("counter", Arc::new(|| Box::new(CounterGrain { count: 0 })))
    }

    fn activations() -> LocalActivations<TokioProviders> {
        LocalActivations::new(TokioProviders::new(), MemberAddress::new("127.0.0.1", 4020))
    }

    #[tokio::test]
    async fn test_activate_and_invoke() {
        let acts = activations();
        let kind = echo_kind();
        let identity = ClusterIdentity::new("echo", "x");

        let pid = acts.activate(&identity, &kind);
        let out = acts
            .invoke(&identity, &pid.local_id, "echo", b"hello".to_vec())
            .await
            .expect("invoke");
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn test_activate_is_idempotent() {
        let acts = activations();
        let kind = echo_kind();
        let identity = ClusterIdentity::new("echo", "x");

        let pid1 = acts.activate(&identity, &kind);
        let pid2 = acts.activate(&identity, &kind);
        assert_eq!(pid1, pid2);
        assert_eq!(acts.len(), 1);
        assert_eq!(kind.activated_count(), 1);
    }

    #[tokio::test]
    async fn test_serial_processing_keeps_state() {
        let acts = activations();
        let kind = counter_kind();
        let identity = ClusterIdentity::new("counter", "c1");
        let pid = acts.activate(&identity, &kind);

        for expected in 1..=5u64 {
            let out = acts
                .invoke(&identity, &pid.local_id, "increment", Vec::new())
                .await
                .expect("invoke");
            assert_eq!(out, expected.to_string().into_bytes());
        }
    }

    #[tokio::test]
    async fn test_invoke_stale_local_id_is_not_active() {
        let acts = activations();
        let kind = echo_kind();
        let identity = ClusterIdentity::new("echo", "x");
        acts.activate(&identity, &kind);

        let err = acts
            .invoke(&identity, "echo/x$999", "echo", Vec::new())
            .await
            .expect_err("stale local id");
        assert_eq!(err, InvokeError::NotActive);
    }

    #[tokio::test]
    async fn test_invoke_unknown_identity_is_not_active() {
        let acts = activations();
        let err = acts
            .invoke(&ClusterIdentity::new("echo", "ghost"), "x", "echo", Vec::new())
            .await
            .expect_err("unknown identity");
        assert_eq!(err, InvokeError::NotActive);
    }

    #[tokio::test]
    async fn test_grain_error_propagates() {
        let acts = activations();
        let kind = echo_kind();
        let identity = ClusterIdentity::new("echo", "x");
        let pid = acts.activate(&identity, &kind);

        let err = acts
            .invoke(&identity, &pid.local_id, "nope", Vec::new())
            .await
            .expect_err("unknown method");
        assert_eq!(
            err,
            InvokeError::Grain(GrainError::UnknownMethod("nope".to_string()))
        );
    }

    #[tokio::test]
    async fn test_deactivate_and_counts() {
        let acts = activations();
        let kind = echo_kind();
        let identity = ClusterIdentity::new("echo", "x");
        acts.activate(&identity, &kind);
        assert_eq!(kind.activated_count(), 1);

        assert!(acts.deactivate(&identity));
        assert_eq!(kind.activated_count(), 0);
        assert!(!acts.deactivate(&identity));
        assert!(acts.is_empty());
    }

    #[tokio::test]
    async fn test_drain_evicts_everything() {
        let acts = activations();
        let kind = echo_kind();
        acts.activate(&ClusterIdentity::new("echo", "a"), &kind);
        acts.activate(&ClusterIdentity::new("echo", "b"), &kind);

        assert_eq!(acts.drain(), 2);
        assert!(acts.is_empty());
        assert_eq!(kind.activated_count(), 0);
    }

    #[tokio::test]
    async fn test_distinct_identities_get_distinct_pids() {
        let acts = activations();
        let kind = echo_kind();
        let p1 = acts.activate(&ClusterIdentity::new("echo", "a"), &kind);
        let p2 = acts.activate(&ClusterIdentity::new("echo", "b"), &kind);
        assert_ne!(p1.local_id, p2.local_id);
    }
}
