//! Error taxonomy for the cluster core.
//!
//! The variants map to the failure classes the core must distinguish:
//!
//! | Variant | Class | Surfaced when |
//! |---|---|---|
//! | `Configuration` | fatal at startup | a required subsystem is missing |
//! | `UnknownKind` | invalid argument | a kind nobody registered/hosts |
//! | `Transient` | retried internally | retries exhausted or caller cancelled |
//! | `Timeout` | bounded operation | per-attempt or overall deadline hit |
//! | `Cancelled` | cooperative | the caller's token fired |
//! | `Unavailable` | fail-fast | operation started after shutdown began |
//! | `Fenced` | fatal | the local member was observed as departed |
//!
//! Placement races (a lost reservation CAS) are *not* an error: the winner's
//! location is returned to the caller.

use thiserror::Error;

/// Errors produced by the cluster core.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// A required subsystem was not configured. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The requested kind is not registered / hosted anywhere.
    #[error("unknown cluster kind {0:?}")]
    UnknownKind(String),

    /// A transient fault (network hiccup, store timeout) that survived the
    /// internal retry budget.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The identity store failed.
    #[error("identity store error: {0}")]
    Store(String),

    /// The remote transport failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A grain handler rejected the request. Not retried.
    #[error("grain error: {0}")]
    Grain(String),

    /// The operation exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation was initiated after shutdown began.
    #[error("cluster is shutting down")]
    Unavailable,

    /// The local member was observed as departed by the provider or by its
    /// own gossip. The cluster self-fences.
    #[error("local member fenced: {0}")]
    Fenced(String),
}
