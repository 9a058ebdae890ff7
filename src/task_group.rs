//! # Task Group
//!
//! A counted completion tracker for outstanding asynchronous work. Work enters the
//! group by taking a [`GroupGuard`]; dropping the guard marks that unit as finished.
//! [`TaskGroup::wait`] resolves once the count reaches zero.
//!
//! The same primitive backs the shared per-block completion group (handlers that
//! must finish before the driver fetches the next block) and the admission
//! throttle (handler-spawned RPC subtasks).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    count: AtomicUsize,
    drained: Notify,
}

/// Cloneable handle to a shared completion counter.
#[derive(Debug, Clone, Default)]
pub struct TaskGroup {
    inner: Arc<Inner>,
}

/// Keeps one unit of work counted in its [`TaskGroup`] until dropped.
#[derive(Debug)]
#[must_use = "the unit of work is finished as soon as the guard is dropped"]
pub struct GroupGuard {
    inner: Arc<Inner>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more unit of outstanding work.
    pub fn enter(&self) -> GroupGuard {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
        GroupGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Number of units currently outstanding.
    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    /// Wait until every outstanding unit has finished.
    ///
    /// Returns immediately when the group is already empty.
    pub async fn wait(&self) {
        loop {
            // Register interest before checking the counter so a guard dropped
            // between the check and the await still wakes us.
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if self.inner.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_on_empty_group_returns_immediately() {
        let group = TaskGroup::new();
        tokio::time::timeout(Duration::from_millis(50), group.wait())
            .await
            .expect("empty group should not block");
    }

    #[tokio::test]
    async fn test_guards_are_counted_until_dropped() {
        let group = TaskGroup::new();
        let a = group.enter();
        let b = group.enter();
        assert_eq!(group.count(), 2);
        drop(a);
        assert_eq!(group.count(), 1);
        drop(b);
        assert_eq!(group.count(), 0);
    }

    #[tokio::test]
    async fn test_wait_resolves_after_last_guard_drops() {
        let group = TaskGroup::new();
        let guard = group.enter();

        let waiter = {
            let group = group.clone();
            tokio::spawn(async move { group.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "wait must block while work is outstanding");

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(guard);
        });

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish once drained")
            .unwrap();
    }
}
