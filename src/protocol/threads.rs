//! Per-thread mutual exclusion.
//!
//! One async mutex per active thread id; waiters are served in arrival
//! order. Entries are removed once the last holder or waiter is gone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockMap = HashMap<String, Arc<AsyncMutex<()>>>;

/// Registry of per-thread locks.
#[derive(Clone, Default)]
pub struct ThreadLocks {
    inner: Arc<Mutex<LockMap>>,
}

impl ThreadLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, LockMap> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for exclusive access to `thread_id`.
    pub async fn lock(&self, thread_id: &str) -> ThreadGuard {
        let lock = self
            .map()
            .entry(thread_id.to_string())
            .or_default()
            .clone();

        let guard = lock.clone().lock_owned().await;
        ThreadGuard {
            thread_id: thread_id.to_string(),
            lock,
            guard: Some(guard),
            locks: self.clone(),
        }
    }

    /// Number of thread ids currently locked or awaited.
    pub fn active(&self) -> usize {
        self.map().len()
    }
}

/// Exclusive access to one thread id; released on drop.
pub struct ThreadGuard {
    thread_id: String,
    lock: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
    locks: ThreadLocks,
}

impl ThreadGuard {
    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }
}

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        let mut map = self.locks.map();
        self.guard.take();

        // map entry + our handle: nobody else holds or awaits this thread
        if Arc::strong_count(&self.lock) == 2 {
            map.remove(&self.thread_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lock_released_and_cleaned_up() {
        let locks = ThreadLocks::new();
        {
            let guard = locks.lock("t1").await;
            assert_eq!(guard.thread_id(), "t1");
            assert_eq!(locks.active(), 1);
        }
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn test_same_thread_is_exclusive() {
        let locks = ThreadLocks::new();
        let guard = locks.lock("t1").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("t1").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn test_different_threads_do_not_block() {
        let locks = ThreadLocks::new();
        let _a = locks.lock("a").await;

        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_waiters_served_in_order() {
        let locks = ThreadLocks::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let first = locks.lock("t").await;

        let mut handles = Vec::new();
        for i in 0..3 {
            let locks = locks.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("t").await;
                order.lock().unwrap().push(i);
            }));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        drop(first);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }
}
