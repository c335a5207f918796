//! Shutdown coordination for the broker loop and the HTTP listener.
//!
//! Long-running tasks are registered with the coordinator. [`drain`]
//! cancels the shared token and gives them a bounded amount of time to
//! finish before aborting whatever is left.
//!
//! [`drain`]: ShutdownCoordinator::drain

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cancellation token plus the tasks that must stop with it.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ShutdownCoordinator {
    /// Create a coordinator with no tracked tasks.
    pub fn new() -> Self {
        Self::default()
    }

    /// A clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Spawn `task` and wait for it on [`drain`](Self::drain).
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.track(tokio::spawn(task));
    }

    /// Wait for an already spawned task on [`drain`](Self::drain).
    pub fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    /// Cancel the token without waiting.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Cancel, then wait up to `timeout` for every tracked task.
    ///
    /// Returns how many tasks had to be aborted.
    pub async fn drain(&self, timeout: Duration) -> usize {
        self.shutdown();
        let handles = std::mem::take(&mut *self.tasks.lock());
        info!(
            tasks = handles.len(),
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "draining tasks"
        );

        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(timeout, futures::future::join_all(handles))
            .await
            .is_ok()
        {
            return 0;
        }

        let stuck: Vec<_> = aborts.into_iter().filter(|h| !h.is_finished()).collect();
        warn!(stuck = stuck.len(), "shutdown timed out, aborting remaining tasks");
        for handle in &stuck {
            handle.abort();
        }
        stuck.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_cancels_every_token() {
        let coord = ShutdownCoordinator::new();
        let (a, b) = (coord.token(), coord.token());
        assert!(!a.is_cancelled());
        coord.shutdown();
        coord.shutdown();
        assert!(coord.token().is_cancelled());
        assert!(a.is_cancelled() && b.is_cancelled());
    }

    #[tokio::test]
    async fn drain_waits_for_cooperative_tasks() {
        let coord = ShutdownCoordinator::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let token = coord.token();
        coord.spawn(async move {
            token.cancelled().await;
            let _ = tx.send("stopped");
        });

        assert_eq!(coord.drain(Duration::from_secs(1)).await, 0);
        assert_eq!(rx.await.unwrap(), "stopped");
    }

    #[tokio::test(start_paused = true)]
    async fn drain_aborts_stragglers() {
        let coord = ShutdownCoordinator::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        coord.track(tokio::spawn(async move {
            let _tx = tx;
            tokio::time::sleep(Duration::from_secs(300)).await;
        }));
        coord.spawn(async {});

        assert_eq!(coord.drain(Duration::from_millis(100)).await, 1);
        // The aborted task drops its sender.
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn second_drain_has_nothing_left() {
        let coord = ShutdownCoordinator::new();
        coord.spawn(async {});
        assert_eq!(coord.drain(Duration::from_secs(1)).await, 0);
        assert_eq!(coord.drain(Duration::from_secs(1)).await, 0);
    }
}
