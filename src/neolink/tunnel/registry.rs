use tokio::{sync::Mutex, task::JoinSet};
use tracing::debug;

/// Tracks every live relay task so a session teardown can close them all at
/// once. Relay tasks own their sockets, so aborting a task closes its
/// connections.
#[derive(Debug, Default)]
pub struct RelayRegistry {
    tasks: Mutex<JoinSet<()>>,
}

impl RelayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().await;
        // Reap whatever already finished so the set does not grow unbounded.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(fut);
    }

    pub async fn active(&self) -> usize {
        let mut tasks = self.tasks.lock().await;
        while tasks.try_join_next().is_some() {}
        tasks.len()
    }

    /// Aborts all live relays and waits for them to finish. Safe to call
    /// repeatedly; a second call on an empty registry is a no-op.
    pub async fn close_all(&self) {
        let mut tasks = self.tasks.lock().await;
        let n = tasks.len();
        if n > 0 {
            debug!(relays = n, "registry: closing all relays");
        }
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
}
