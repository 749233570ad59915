//! Per-call API and DB operation counters
//!
//! Business code calls [`record_api_call`] / [`record_db_op`] without knowing
//! whether it runs under an instrumented call. Sync calls push a frame on a
//! thread-local stack; async calls run inside a task-local scope. Counts are
//! inclusive: an outer instrumented call also sees its inner calls' counts.

use std::cell::RefCell;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct CallCounters {
    api_calls: AtomicU64,
    db_ops: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub api_calls: u64,
    pub db_ops: u64,
}

impl CallCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            api_calls: self.api_calls.load(Ordering::Relaxed),
            db_ops: self.db_ops.load(Ordering::Relaxed),
        }
    }

    fn add(&self, counts: CounterSnapshot) {
        self.api_calls.fetch_add(counts.api_calls, Ordering::Relaxed);
        self.db_ops.fetch_add(counts.db_ops, Ordering::Relaxed);
    }
}

thread_local! {
    static THREAD_FRAMES: RefCell<Vec<Arc<CallCounters>>> = const { RefCell::new(Vec::new()) };
}

tokio::task_local! {
    static TASK_COUNTERS: Arc<CallCounters>;
}

/// Count one outbound API call against the enclosing instrumented call(s)
pub fn record_api_call() {
    record(CounterSnapshot { api_calls: 1, db_ops: 0 });
}

/// Count one database operation against the enclosing instrumented call(s)
pub fn record_db_op() {
    record(CounterSnapshot { api_calls: 0, db_ops: 1 });
}

fn record(counts: CounterSnapshot) {
    THREAD_FRAMES.with(|frames| {
        for frame in frames.borrow().iter() {
            frame.add(counts);
        }
    });
    let _ = TASK_COUNTERS.try_with(|c| c.add(counts));
}

/// Run a sync closure with a fresh counter frame
pub(crate) fn count_sync<R>(f: impl FnOnce() -> R) -> (R, CounterSnapshot) {
    let counters = Arc::new(CallCounters::default());
    THREAD_FRAMES.with(|frames| frames.borrow_mut().push(counters.clone()));

    // Pops the frame even when `f` unwinds
    struct Pop;
    impl Drop for Pop {
        fn drop(&mut self) {
            THREAD_FRAMES.with(|frames| {
                frames.borrow_mut().pop();
            });
        }
    }
    let guard = Pop;
    let out = f();
    drop(guard);

    (out, counters.snapshot())
}

/// Run a future inside a fresh task-local counter scope
///
/// Counts are folded into the parent async scope, if any, once the future
/// finishes.
pub(crate) async fn count_async<F: Future>(fut: F) -> (F::Output, CounterSnapshot) {
    let parent = TASK_COUNTERS.try_with(|c| c.clone()).ok();
    let counters = Arc::new(CallCounters::default());

    let out = TASK_COUNTERS.scope(counters.clone(), fut).await;
    let snapshot = counters.snapshot();
    if let Some(parent) = parent {
        parent.add(snapshot);
    }
    (out, snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_frames_are_inclusive() {
        let ((_, inner), outer) = count_sync(|| {
            record_api_call();
            count_sync(|| {
                record_db_op();
                record_db_op();
            })
        });
        assert_eq!(inner, CounterSnapshot { api_calls: 0, db_ops: 2 });
        assert_eq!(outer, CounterSnapshot { api_calls: 1, db_ops: 2 });
    }

    #[test]
    fn test_counts_outside_a_call_are_dropped() {
        record_api_call();
        let (_, counts) = count_sync(|| ());
        assert_eq!(counts, CounterSnapshot::default());
    }

    #[tokio::test]
    async fn test_async_scopes_fold_into_parent() {
        let (inner, outer) = count_async(async {
            record_api_call();
            let (_, inner) = count_async(async {
                tokio::task::yield_now().await;
                record_api_call();
                record_db_op();
            })
            .await;
            inner
        })
        .await;
        assert_eq!(inner, CounterSnapshot { api_calls: 1, db_ops: 1 });
        assert_eq!(outer, CounterSnapshot { api_calls: 2, db_ops: 1 });
    }
}
