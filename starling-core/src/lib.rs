//! # starling-core
//!
//! Runtime-environment abstractions for the starling cluster runtime.
//!
//! Cluster code never calls tokio directly for time, randomness, or task
//! spawning. Instead it depends on the provider traits in this crate, so the
//! same protocol code can run against production providers or against test
//! doubles with compressed timings.
//!
//! ## Provider Traits
//!
//! | Trait | Production | Purpose |
//! |-------|------------|---------|
//! | [`TimeProvider`] | [`TokioTimeProvider`] | Sleep, timeout, now() |
//! | [`TaskProvider`] | [`TokioTaskProvider`] | Named background tasks |
//! | [`RandomProvider`] | [`TokioRandomProvider`] | Member ids, peer sampling, retry jitter |
//!
//! **Important**: never call tokio directly in cluster code.
//! - ❌ `tokio::time::sleep()`
//! - ✅ `time_provider.sleep()`
//!
//! ## Core Types
//!
//! - [`MemberAddress`]: `host:port` address of a cluster member

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod address;
mod providers;
mod random;
mod task;
mod time;

pub use address::{AddressParseError, MemberAddress};
pub use providers::{Providers, TokioProviders};
pub use random::{RandomProvider, TokioRandomProvider};
pub use task::{TaskProvider, TokioTaskProvider};
pub use time::{TimeError, TimeProvider, TokioTimeProvider};
