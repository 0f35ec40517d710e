// locks.rs: Per-task mutual exclusion.
//
// Every mutation of a task (router command or reconciliation step) runs
// inside `with_lock(task_id, ..)`, so a cancel and a loop-driven dispatch
// can never interleave. Different tasks never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use uuid::Uuid;

/// A map of per-task mutexes. Entries are dropped once nobody holds them.
#[derive(Default)]
pub struct TaskLocks {
    inner: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl TaskLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `task_id`.
    ///
    /// A poisoned lock only guards `()`, so poisoning is ignored: the row in
    /// the store is the state, and it is re-read under the lock anyway.
    pub fn with_lock<T>(&self, task_id: Uuid, f: impl FnOnce() -> T) -> T {
        let cell = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(map.entry(task_id).or_default())
        };

        let result = {
            let _guard = cell.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };

        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        // Two references left: the map's and ours.
        if Arc::strong_count(&cell) == 2 {
            map.remove(&task_id);
        }
        result
    }

    /// Number of tasks currently holding or waiting on a lock.
    pub fn active(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn same_task_is_serialized() {
        let locks = Arc::new(TaskLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let id = Uuid::new_v4();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    locks.with_lock(id, || {
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        thread::sleep(Duration::from_millis(2));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    });
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(locks.active(), 0);
    }

    #[test]
    fn different_tasks_do_not_block_each_other() {
        let locks = TaskLocks::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let value = locks.with_lock(a, || locks.with_lock(b, || 42));
        assert_eq!(value, 42);
        assert_eq!(locks.active(), 0);
    }
}
