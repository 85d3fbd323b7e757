//! Remote transport contract and the in-process implementation.
//!
//! The cluster core does not own a wire protocol; it consumes this contract.
//! Control-plane traffic (gossip exchange, activation placement) and grain
//! requests all travel as [`ClusterMessage`] values. A real deployment binds
//! a framed RPC transport; tests and single-process clusters use
//! [`InMemoryTransport`] over a shared [`InMemoryNetwork`] hub.
//!
//! A request to an address nobody serves resolves to
//! [`TransportError::DeadLetter`]; callers treat that as a stale location
//! and re-resolve.
//!
//! Grain payloads cross the wire as opaque bytes; [`encode_payload`] and
//! [`decode_payload`] are the boundary between typed caller values and
//! those bytes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use starling_core::{MemberAddress, Providers, TimeProvider};
use thiserror::Error;
use tracing::trace;

use crate::gossip::GossipEnvelope;
use crate::types::{ClusterIdentity, MemberId, Pid};

/// Control-plane and grain traffic between members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClusterMessage {
    /// Anti-entropy pull: "send me what I have not seen".
    GossipPull {
        /// Requesting member.
        from: MemberId,
        /// The requester's vector clock.
        clock: HashMap<MemberId, u64>,
    },
    /// Reply to a pull: entries strictly newer than the requester's clock.
    GossipDelta {
        /// The delta entries.
        entries: Vec<GossipEnvelope>,
        /// Whether the delta was paged (more remains).
        truncated: bool,
    },
    /// One-way state push (used for the graceful-departure broadcast).
    GossipPush {
        /// The pushed entries.
        entries: Vec<GossipEnvelope>,
    },
    /// Ask the receiving member to own an activation for the identity.
    Activate {
        /// The identity to place.
        identity: ClusterIdentity,
    },
    /// Placement succeeded (or already existed); here is its location.
    ActivateOk {
        /// The activation's location.
        pid: Pid,
    },
    /// Placement failed.
    ActivateFailed {
        /// Why.
        reason: String,
    },
    /// A request for a grain activation hosted by the receiver.
    GrainRequest {
        /// Identity of the target grain.
        identity: ClusterIdentity,
        /// Local id from the caller's pid; detects stale locations.
        local_id: String,
        /// Method name.
        method: String,
        /// Opaque request payload.
        payload: Vec<u8>,
    },
    /// Grain response.
    GrainResponse {
        /// Handler result: payload or application error.
        result: Result<Vec<u8>, String>,
    },
}

/// Transport-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Nothing is listening at the target address.
    #[error("dead letter: no receiver at target")]
    DeadLetter,
    /// The request did not complete within its timeout.
    #[error("request timed out")]
    Timeout,
    /// The target was reachable but the exchange failed.
    #[error("unreachable: {0}")]
    Unreachable(String),
    /// A payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
    /// The transport is not started (or already stopped).
    #[error("transport not started")]
    NotStarted,
}

/// Encode a typed grain payload into wire bytes.
///
/// # Errors
///
/// Returns [`TransportError::Codec`] when serialization fails.
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, TransportError> {
    serde_json::to_vec(value).map_err(|e| TransportError::Codec(e.to_string()))
}

/// Decode wire bytes back into a typed grain payload.
///
/// # Errors
///
/// Returns [`TransportError::Codec`] when the bytes do not parse as `T`.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, TransportError> {
    serde_json::from_slice(bytes).map_err(|e| TransportError::Codec(e.to_string()))
}

/// Receiver side of the transport: one handler per member.
#[async_trait]
pub trait RemoteHandler: Send + Sync {
    /// Handle an incoming message, optionally producing a reply.
    ///
    /// Returning `None` for a request resolves to a dead letter on the
    /// caller's side.
    async fn handle(&self, message: ClusterMessage) -> Option<ClusterMessage>;
}

/// Remote transport consumed by the cluster core.
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Start serving: register the handler for inbound messages.
    async fn start(&self, handler: Arc<dyn RemoteHandler>) -> Result<(), TransportError>;

    /// Stop serving. Idempotent.
    async fn stop(&self) -> Result<(), TransportError>;

    /// Fire-and-forget send.
    async fn send(
        &self,
        target: &MemberAddress,
        message: ClusterMessage,
    ) -> Result<(), TransportError>;

    /// Request/response with a per-attempt timeout.
    async fn request(
        &self,
        target: &MemberAddress,
        message: ClusterMessage,
        timeout: Duration,
    ) -> Result<ClusterMessage, TransportError>;
}

/// Shared in-process "network": a routing table from address to handler.
///
/// Every member of a test cluster gets an [`InMemoryTransport`] bound to the
/// same hub.
#[derive(Default)]
pub struct InMemoryNetwork {
    routes: RwLock<HashMap<MemberAddress, Arc<dyn RemoteHandler>>>,
}

impl InMemoryNetwork {
    /// Create an empty hub.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, address: MemberAddress, handler: Arc<dyn RemoteHandler>) {
        self.routes
            .write()
            .expect("network routes lock poisoned")
            .insert(address, handler);
    }

    fn deregister(&self, address: &MemberAddress) {
        self.routes
            .write()
            .expect("network routes lock poisoned")
            .remove(address);
    }

    fn route(&self, address: &MemberAddress) -> Option<Arc<dyn RemoteHandler>> {
        self.routes
            .read()
            .expect("network routes lock poisoned")
            .get(address)
            .cloned()
    }
}

/// In-process transport bound to one member address.
pub struct InMemoryTransport<P: Providers> {
    providers: P,
    network: Arc<InMemoryNetwork>,
    local: MemberAddress,
}

impl<P: Providers> InMemoryTransport<P> {
    /// Create a transport for `local` on the shared hub.
    pub fn new(providers: P, network: Arc<InMemoryNetwork>, local: MemberAddress) -> Arc<Self> {
        Arc::new(Self {
            providers,
            network,
            local,
        })
    }
}

#[async_trait]
impl<P: Providers> ClusterTransport for InMemoryTransport<P> {
    async fn start(&self, handler: Arc<dyn RemoteHandler>) -> Result<(), TransportError> {
        self.network.register(self.local.clone(), handler);
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.network.deregister(&self.local);
        Ok(())
    }

    async fn send(
        &self,
        target: &MemberAddress,
        message: ClusterMessage,
    ) -> Result<(), TransportError> {
        let Some(handler) = self.network.route(target) else {
            return Err(TransportError::DeadLetter);
        };
        trace!(target = %target, "send");
        let _ = handler.handle(message).await;
        Ok(())
    }

    async fn request(
        &self,
        target: &MemberAddress,
        message: ClusterMessage,
        timeout: Duration,
    ) -> Result<ClusterMessage, TransportError> {
        let Some(handler) = self.network.route(target) else {
            return Err(TransportError::DeadLetter);
        };
        trace!(target = %target, "request");
        let reply = self
            .providers
            .time()
            .timeout(timeout, handler.handle(message))
            .await
            .map_err(|_| TransportError::Timeout)?;
        reply.ok_or(TransportError::DeadLetter)
    }
}
