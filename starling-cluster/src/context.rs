//! Request/response over a virtual identity.
//!
//! [`ClusterContext::request`] resolves the target through the PID cache
//! (falling back to the identity lookup), sends the request with a
//! per-attempt timeout, and retries across re-placements: a transport
//! failure or dead-letter invalidates the cached location and resolves
//! again. Retries are capped by the attempt budget and the caller's
//! cancellation token.
//!
//! The core does not deduplicate requests; exactly-once semantics are an
//! application-layer concern.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use starling_core::{Providers, RandomProvider, TimeProvider};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ClusterError;
use crate::identity::IdentityLookup;
use crate::pid_cache::PidCache;
use crate::transport::{
    ClusterMessage, ClusterTransport, TransportError, decode_payload, encode_payload,
};
use crate::types::ClusterIdentity;

/// Retry/timeout shape for requests.
#[derive(Debug, Clone)]
pub struct RequestConfig {
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Attempt budget.
    pub max_retries: usize,
    /// Base backoff between attempts (exponential, jittered).
    pub retry_backoff: Duration,
}

/// Sends typed requests to virtual actors.
pub struct ClusterContext<P: Providers> {
    providers: P,
    config: RequestConfig,
    pid_cache: Arc<PidCache>,
    lookup: Arc<dyn IdentityLookup>,
    transport: Arc<dyn ClusterTransport>,
    shutdown: CancellationToken,
}

impl<P: Providers> ClusterContext<P> {
    /// Create a context over the given resolution and transport components.
    pub fn new(
        providers: P,
        config: RequestConfig,
        pid_cache: Arc<PidCache>,
        lookup: Arc<dyn IdentityLookup>,
        transport: Arc<dyn ClusterTransport>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            providers,
            config,
            pid_cache,
            lookup,
            transport,
            shutdown,
        })
    }

    /// Send `message` to the grain named by `identity` and await a typed
    /// response.
    ///
    /// # Errors
    ///
    /// - [`ClusterError::UnknownKind`] when no member hosts the kind
    /// - [`ClusterError::Grain`] when the handler rejected the request
    /// - [`ClusterError::Cancelled`] / [`ClusterError::Unavailable`] on
    ///   cancellation or shutdown
    /// - [`ClusterError::Timeout`] / [`ClusterError::Transient`] when the
    ///   attempt budget is exhausted
    pub async fn request<TReq, TRes>(
        &self,
        identity: &ClusterIdentity,
        method: &str,
        message: &TReq,
        cancel: &CancellationToken,
    ) -> Result<TRes, ClusterError>
    where
        TReq: Serialize + Sync,
        TRes: DeserializeOwned,
    {
        let payload =
            encode_payload(message).map_err(|e| ClusterError::Transport(e.to_string()))?;
        let mut last_error = ClusterError::Timeout;

        for attempt in 0..self.config.max_retries {
            if self.shutdown.is_cancelled() {
                return Err(ClusterError::Unavailable);
            }
            if cancel.is_cancelled() {
                return Err(ClusterError::Cancelled);
            }

            // Resolve: cache first, lookup on miss.
            let pid = match self.pid_cache.try_get(identity) {
                Some(pid) => pid,
                None => match self.lookup.get(identity, cancel).await {
                    Ok(pid) => pid,
                    Err(
                        error @ (ClusterError::Cancelled
                        | ClusterError::UnknownKind(_)
                        | ClusterError::Unavailable),
                    ) => return Err(error),
                    Err(error) => {
                        debug!(identity = %identity, attempt, %error, "resolution failed");
                        last_error = error;
                        self.backoff(attempt).await;
                        continue;
                    }
                },
            };

            let request = ClusterMessage::GrainRequest {
                identity: identity.clone(),
                local_id: pid.local_id.clone(),
                method: method.to_string(),
                payload: payload.clone(),
            };
            match self
                .transport
                .request(&pid.address, request, self.config.timeout)
                .await
            {
                Ok(ClusterMessage::GrainResponse { result: Ok(bytes) }) => {
                    let now = self.providers.time().now();
                    self.pid_cache.try_set(identity, pid, now);
                    self.pid_cache.touch(identity, now);
                    return decode_payload(&bytes)
                        .map_err(|e| ClusterError::Transport(e.to_string()));
                }
                Ok(ClusterMessage::GrainResponse {
                    result: Err(reason),
                }) => {
                    // Application-level rejection: retrying will not help.
                    return Err(ClusterError::Grain(reason));
                }
                Ok(other) => {
                    debug!(identity = %identity, ?other, "unexpected response, invalidating");
                    self.pid_cache.remove(identity);
                    last_error = ClusterError::Transient("unexpected response".to_string());
                }
                Err(TransportError::Timeout) => {
                    self.pid_cache.remove(identity);
                    last_error = ClusterError::Timeout;
                }
                Err(error) => {
                    // Dead letter or unreachable: the location is stale.
                    debug!(identity = %identity, %error, "send failed, invalidating");
                    self.pid_cache.remove(identity);
                    last_error = ClusterError::Transient(error.to_string());
                }
            }
            self.backoff(attempt).await;
        }
        Err(last_error)
    }

    async fn backoff(&self, attempt: usize) {
        let base = self.config.retry_backoff.saturating_mul(1 << attempt.min(8));
        let jitter = 0.5 + self.providers.random().jitter();
        self.providers.time().sleep(base.mul_f64(jitter)).await;
    }

    /// The PID cache backing this context. Exposed for the orchestrator's
    /// topology wiring and for tests.
    pub fn pid_cache(&self) -> &Arc<PidCache> {
        &self.pid_cache
    }
}
