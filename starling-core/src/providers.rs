//! Provider bundle trait for simplified type parameters.
//!
//! Without bundling, cluster components would carry three separate type
//! parameters (`T: TimeProvider, TP: TaskProvider, R: RandomProvider`). The
//! [`Providers`] trait collapses them into one, so component signatures read
//! `struct Gossiper<P: Providers>`.

use crate::{
    RandomProvider, TaskProvider, TimeProvider, TokioRandomProvider, TokioTaskProvider,
    TokioTimeProvider,
};

/// Bundle of all provider types for a runtime environment.
///
/// Associated types preserve type information at compile time without
/// runtime dispatch; accessor methods provide convenient access to the
/// individual providers.
pub trait Providers: Clone + Send + Sync + 'static {
    /// Time provider type for sleep, timeout, and time queries.
    type Time: TimeProvider;

    /// Task provider type for spawning background tasks.
    type Task: TaskProvider;

    /// Random provider type for sampling and jitter.
    type Random: RandomProvider;

    /// Get the time provider instance.
    fn time(&self) -> &Self::Time;

    /// Get the task provider instance.
    fn task(&self) -> &Self::Task;

    /// Get the random provider instance.
    fn random(&self) -> &Self::Random;
}

/// Production providers backed by the Tokio runtime.
#[derive(Clone)]
pub struct TokioProviders {
    time: TokioTimeProvider,
    task: TokioTaskProvider,
    random: TokioRandomProvider,
}

impl TokioProviders {
    /// Create a new production providers bundle.
    pub fn new() -> Self {
        Self {
            time: TokioTimeProvider::new(),
            task: TokioTaskProvider,
            random: TokioRandomProvider::new(),
        }
    }
}

impl Default for TokioProviders {
    fn default() -> Self {
        Self::new()
    }
}

impl Providers for TokioProviders {
    type Time = TokioTimeProvider;
    type Task = TokioTaskProvider;
    type Random = TokioRandomProvider;

    fn time(&self) -> &Self::Time {
        &self.time
    }

    fn task(&self) -> &Self::Task {
        &self.task
    }

    fn random(&self) -> &Self::Random {
        &self.random
    }
}
