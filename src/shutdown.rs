//! Connection tracking for graceful shutdown
//!
//! Every connection and tunnel task is spawned through a [`ConnectionTracker`].
//! Shutdown first signals draining (listeners stop accepting, HTTP
//! connections finish their current exchange), waits for tracked tasks up to
//! a grace period, then forces the rest to drop their sockets.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

struct TrackerInner {
    active: AtomicUsize,
    idle: Notify,
    drain: watch::Sender<bool>,
    force: watch::Sender<bool>,
}

/// How a shutdown ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every task finished within the grace period
    Drained,
    /// Tasks still running at the deadline were dropped
    Forced { remaining: usize },
}

#[derive(Clone)]
pub struct ConnectionTracker {
    inner: Arc<TrackerInner>,
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTracker {
    pub fn new() -> Self {
        let (drain, _) = watch::channel(false);
        let (force, _) = watch::channel(false);
        Self {
            inner: Arc::new(TrackerInner {
                active: AtomicUsize::new(0),
                idle: Notify::new(),
                drain,
                force,
            }),
        }
    }

    /// Spawn a tracked task that is dropped on forced shutdown
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = ActiveGuard::new(Arc::clone(&self.inner));
        let mut force = self.inner.force.subscribe();

        tokio::spawn(async move {
            let _guard = guard;
            tokio::select! {
                _ = task => {}
                _ = force.wait_for(|forced| *forced) => {
                    debug!("Task dropped by forced shutdown");
                }
            }
        });
    }

    /// Number of tracked tasks still running
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    pub fn is_draining(&self) -> bool {
        *self.inner.drain.borrow()
    }

    /// Resolves once draining has started
    pub async fn draining(&self) {
        let mut rx = self.inner.drain.subscribe();
        let _ = rx.wait_for(|draining| *draining).await;
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Drain, then force after `grace`
    pub async fn shutdown(&self, grace: Duration) -> ShutdownOutcome {
        self.inner.drain.send_replace(true);
        info!(active = self.active(), grace_ms = grace.as_millis() as u64, "Draining connections");

        if tokio::time::timeout(grace, self.wait_idle()).await.is_ok() {
            return ShutdownOutcome::Drained;
        }

        let remaining = self.active();
        warn!(remaining, "Grace period expired, closing remaining connections");
        self.inner.force.send_replace(true);

        if tokio::time::timeout(Duration::from_secs(1), self.wait_idle())
            .await
            .is_err()
        {
            warn!(active = self.active(), "Tasks still winding down after forced shutdown");
        }
        ShutdownOutcome::Forced { remaining }
    }
}

struct ActiveGuard {
    inner: Arc<TrackerInner>,
}

impl ActiveGuard {
    fn new(inner: Arc<TrackerInner>) -> Self {
        inner.active.fetch_add(1, Ordering::AcqRel);
        Self { inner }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if self.inner.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn test_shutdown_with_no_tasks_drains_immediately() {
        let tracker = ConnectionTracker::new();
        assert_eq!(
            tracker.shutdown(Duration::from_millis(100)).await,
            ShutdownOutcome::Drained
        );
        assert!(tracker.is_draining());
    }

    #[tokio::test]
    async fn test_tasks_that_honor_draining_finish_gracefully() {
        let tracker = ConnectionTracker::new();
        let finished = Arc::new(AtomicBool::new(false));

        let t = tracker.clone();
        let f = Arc::clone(&finished);
        tracker.spawn(async move {
            t.draining().await;
            f.store(true, Ordering::SeqCst);
        });
        assert_eq!(tracker.active(), 1);

        assert_eq!(
            tracker.shutdown(Duration::from_secs(1)).await,
            ShutdownOutcome::Drained
        );
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(tracker.active(), 0);
    }

    #[tokio::test]
    async fn test_stuck_tasks_are_forced() {
        let tracker = ConnectionTracker::new();
        tracker.spawn(std::future::pending());

        let outcome = tracker.shutdown(Duration::from_millis(50)).await;
        assert_eq!(outcome, ShutdownOutcome::Forced { remaining: 1 });
        assert_eq!(tracker.active(), 0);
    }
}
