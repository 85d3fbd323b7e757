//! Task spawning abstraction for cluster background loops.

use std::future::Future;

/// Provider for spawning named background tasks.
///
/// Every long-running loop in the cluster (gossip ticks, cache cleanup,
/// provider heartbeats) goes through this trait so tests can account for
/// spawned work and production code gets named tasks for diagnostics.
pub trait TaskProvider: Clone + Send + Sync + 'static {
    /// Spawn a named task on the runtime.
    ///
    /// Names identify the cluster's long-running loops (gossip tick, cache
    /// cleanup, provider heartbeat). Instrumented providers can surface
    /// them; the plain Tokio provider discards them.
    fn spawn_task<F>(&self, name: &str, future: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static;

    /// Yield control to allow other tasks to run.
    fn yield_now(&self) -> impl Future<Output = ()> + Send;
}

/// Production task provider using `tokio::spawn`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTaskProvider;

impl TaskProvider for TokioTaskProvider {
    fn spawn_task<F>(&self, name: &str, future: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let _ = name;
        tokio::spawn(future)
    }

    fn yield_now(&self) -> impl Future<Output = ()> + Send {
        tokio::task::yield_now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_task_runs() {
        let task = TokioTaskProvider;
        let (tx, rx) = tokio::sync::oneshot::channel();
        task.spawn_task("unit-test", async move {
            let _ = tx.send(7u8);
        });
        assert_eq!(rx.await, Ok(7));
    }

    #[tokio::test]
    async fn test_join_handle_completes() {
        let task = TokioTaskProvider;
        let handle = task.spawn_task("noop", async {});
        assert!(handle.await.is_ok());
    }
}
