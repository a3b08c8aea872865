//! One pass of a controller over its candidate items.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use meridian_state::{LockBackend, LockGuard};

use crate::error::{ControlError, ControlResult};

use super::WorkItemSelector;

/// A reconciler driven by [`ControllerTick`].
#[async_trait]
pub trait Controller: Send + Sync {
    type Id: fmt::Display + Clone + Send + Sync + 'static;

    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Prefix of the per-item lock, or `None` when [`Self::process`] takes
    /// its own locks.
    fn lock_prefix(&self) -> Option<&'static str>;

    /// Items that may need work. Read without locks, so possibly stale.
    async fn candidates(&self) -> ControlResult<Vec<Self::Id>>;

    /// Advance one item. Called with the item's lock held.
    async fn process(&self, id: &Self::Id) -> ControlResult<()>;
}

/// What a tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub candidates: usize,
    pub processed: usize,
    /// Skipped because another worker held the lock.
    pub contended: usize,
    pub failed: usize,
}

/// Lock name for item `id` under `prefix`.
#[must_use]
pub fn lock_name(prefix: &str, id: impl fmt::Display) -> String {
    format!("{prefix}-{id}")
}

/// Run `f` while holding lock `name`.
///
/// Returns `Ok(None)` without running `f` when the lock is held elsewhere.
/// The lock is released whether `f` returns, fails or panics.
pub async fn with_lock<T, F, Fut>(locks: &dyn LockBackend, name: &str, f: F) -> ControlResult<Option<T>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ControlResult<T>>,
{
    let Some(guard) = locks.try_acquire(name).await? else {
        tracing::debug!(lock = %name, "lock held elsewhere, skipping");
        return Ok(None);
    };

    let outcome = catch_panic(f()).await;
    release(guard).await;
    outcome.map(Some)
}

async fn catch_panic<T>(fut: impl Future<Output = ControlResult<T>>) -> ControlResult<T> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(ControlError::internal(format!(
            "panicked: {}",
            panic_message(panic.as_ref())
        ))),
    }
}

async fn release(guard: LockGuard) {
    let resource = guard.resource().to_owned();
    if let Err(e) = guard.release().await {
        tracing::warn!(lock = %resource, error = %e, "failed to release lock");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}

/// Lists, shuffles and processes candidates one at a time under their locks.
#[derive(Clone)]
pub struct ControllerTick {
    locks: Arc<dyn LockBackend>,
    selector: Arc<WorkItemSelector>,
}

impl ControllerTick {
    #[must_use]
    pub fn new(locks: Arc<dyn LockBackend>, selector: Arc<WorkItemSelector>) -> Self {
        Self { locks, selector }
    }

    /// Process every candidate of `controller` once.
    ///
    /// Failures are logged per item and never stop the rest of the batch.
    pub async fn run<C: Controller + ?Sized>(&self, controller: &C) -> TickReport {
        let mut report = TickReport::default();

        let mut ids = match controller.candidates().await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(controller = controller.name(), error = %e, "failed to list candidates");
                return report;
            }
        };
        self.selector.shuffle(&mut ids);
        report.candidates = ids.len();

        for id in &ids {
            let outcome = match controller.lock_prefix() {
                Some(prefix) => {
                    let name = lock_name(prefix, id);
                    with_lock(self.locks.as_ref(), &name, || controller.process(id)).await
                }
                None => catch_panic(controller.process(id)).await.map(Some),
            };

            match outcome {
                Ok(Some(())) => report.processed += 1,
                Ok(None) => report.contended += 1,
                Err(e) => {
                    report.failed += 1;
                    if e.is_transient() {
                        tracing::warn!(
                            controller = controller.name(),
                            item_id = %id,
                            error = %e,
                            "failed to process item, retrying next tick"
                        );
                    } else {
                        tracing::error!(
                            controller = controller.name(),
                            item_id = %id,
                            error = %e,
                            "item needs manual attention"
                        );
                    }
                }
            }
        }

        tracing::debug!(
            controller = controller.name(),
            candidates = report.candidates,
            processed = report.processed,
            contended = report.contended,
            failed = report.failed,
            "tick finished"
        );
        report
    }
}

impl fmt::Debug for ControllerTick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerTick")
            .field("selector", &self.selector)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use meridian_state::MemoryLock;
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct Scripted {
        ids: Vec<u32>,
        seen: Mutex<Vec<u32>>,
        locked: Option<&'static str>,
        fail_listing: bool,
    }

    #[async_trait]
    impl Controller for Scripted {
        type Id = u32;

        fn name(&self) -> &'static str {
            "scripted"
        }

        fn lock_prefix(&self) -> Option<&'static str> {
            self.locked
        }

        async fn candidates(&self) -> ControlResult<Vec<u32>> {
            if self.fail_listing {
                return Err(ControlError::fleet("listing failed"));
            }
            Ok(self.ids.clone())
        }

        async fn process(&self, id: &u32) -> ControlResult<()> {
            self.seen.lock().push(*id);
            match id {
                13 => Err(ControlError::invariant("unlucky")),
                66 => panic!("item {id} exploded"),
                _ => Ok(()),
            }
        }
    }

    async fn explode() -> ControlResult<()> {
        panic!("boom")
    }

    fn tick(locks: &MemoryLock) -> ControllerTick {
        ControllerTick::new(Arc::new(locks.clone()), Arc::new(WorkItemSelector::seeded(1)))
    }

    #[tokio::test]
    async fn failures_do_not_stop_the_batch() {
        let locks = MemoryLock::new();
        let controller = Scripted {
            ids: vec![1, 13, 66, 2],
            locked: Some("TEST"),
            ..Scripted::default()
        };

        let report = tick(&locks).run(&controller).await;

        assert_eq!(
            report,
            TickReport {
                candidates: 4,
                processed: 2,
                contended: 0,
                failed: 2,
            }
        );
        let mut seen = controller.seen.lock().clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2, 13, 66]);

        for id in [1, 13, 66, 2] {
            assert!(!locks.is_held(&lock_name("TEST", id)).await);
        }
    }

    #[tokio::test]
    async fn held_locks_are_skipped_silently() {
        let locks = MemoryLock::new();
        let _held = locks.try_acquire("TEST-2").await.unwrap().unwrap();
        let controller = Scripted {
            ids: vec![1, 2],
            locked: Some("TEST"),
            ..Scripted::default()
        };

        let report = tick(&locks).run(&controller).await;

        assert_eq!(report.processed, 1);
        assert_eq!(report.contended, 1);
        assert_eq!(*controller.seen.lock(), vec![1]);
    }

    #[tokio::test]
    async fn unlocked_controllers_still_catch_panics() {
        let locks = MemoryLock::new();
        let controller = Scripted {
            ids: vec![66, 3],
            locked: None,
            ..Scripted::default()
        };

        let report = tick(&locks).run(&controller).await;

        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn listing_failure_ends_the_tick() {
        let locks = MemoryLock::new();
        let controller = Scripted {
            ids: vec![1],
            locked: Some("TEST"),
            fail_listing: true,
            ..Scripted::default()
        };

        let report = tick(&locks).run(&controller).await;

        assert_eq!(report, TickReport::default());
        assert!(controller.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn with_lock_releases_after_panic() {
        let locks = MemoryLock::new();

        let result = with_lock(&locks, "PANIC-1", explode).await;

        assert!(matches!(result, Err(ControlError::Internal(ref m)) if m.contains("boom")));
        assert!(!locks.is_held("PANIC-1").await);
    }

    #[tokio::test]
    async fn with_lock_skips_when_held() {
        let locks = MemoryLock::new();
        let _held = locks.try_acquire("BUSY-1").await.unwrap().unwrap();

        let ran = with_lock(&locks, "BUSY-1", || async { Ok(()) }).await.unwrap();
        assert!(ran.is_none());
    }

    #[test]
    fn lock_names_join_prefix_and_id() {
        assert_eq!(lock_name("CLUSTERREPLACER", "01hx"), "CLUSTERREPLACER-01hx");
    }
}
