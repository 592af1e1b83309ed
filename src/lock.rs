//! Per-release advisory locks
//!
//! Mutating lifecycle operations on the same release (or the same artifact
//! key) are serialised; operations on different keys never contend. Locks
//! are in-process only and do not coordinate between replicas.
//!
//! A key's entry lives only while someone holds or waits on it: the last
//! guard out removes it, so the table stays proportional to in-flight work.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// What a lifecycle operation mutates
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum LockKey {
    /// A release in a namespace of a target context
    Release {
        /// Release name
        release: String,
        /// Namespace
        namespace: String,
        /// Target context id
        context: String,
    },
    /// An artifact store key
    Artifact(String),
}

impl LockKey {
    /// Key for a release
    pub fn release(
        release: impl Into<String>,
        namespace: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        Self::Release {
            release: release.into(),
            namespace: namespace.into(),
            context: context.into(),
        }
    }
}

type LockTable = DashMap<LockKey, Arc<Mutex<()>>>;

/// Keyed async mutexes
#[derive(Default)]
pub struct ReleaseLocks {
    locks: Arc<LockTable>,
}

/// Held lock; released on drop
pub struct ReleaseGuard {
    key: LockKey,
    table: Arc<LockTable>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the table's own reference left: nobody holds or waits
        self.table
            .remove_if(&self.key, |_, m| Arc::strong_count(m) == 1);
    }
}

impl ReleaseLocks {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and take the lock for `key`
    pub async fn acquire(&self, key: LockKey) -> ReleaseGuard {
        // Clone the Arc out so the map shard is not held across the await
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        ReleaseGuard {
            key,
            table: self.locks.clone(),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = Arc::new(ReleaseLocks::new());
        let key = LockKey::release("ml-job-1", "ns-a", "ctx-1");

        let held = locks.acquire(key.clone()).await;

        let locks2 = locks.clone();
        let key2 = key.clone();
        let waiter = tokio::spawn(async move {
            let _g = locks2.acquire(key2).await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let locks = ReleaseLocks::new();
        let _a = locks.acquire(LockKey::release("ml-job-1", "ns-a", "ctx-1")).await;
        let _b = tokio::time::timeout(
            Duration::from_millis(100),
            locks.acquire(LockKey::release("ml-job-1", "ns-b", "ctx-1")),
        )
        .await
        .expect("different namespace must not block");
        let _c = tokio::time::timeout(
            Duration::from_millis(100),
            locks.acquire(LockKey::Artifact("bundle-v3".to_string())),
        )
        .await
        .expect("artifact key must not block");
    }

    #[tokio::test]
    async fn released_keys_leave_the_table() {
        let locks = ReleaseLocks::new();
        let held = locks.acquire(LockKey::Artifact("a".to_string())).await;
        drop(locks.acquire(LockKey::Artifact("b".to_string())).await);
        assert_eq!(locks.len(), 1);

        drop(held);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn many_distinct_keys_do_not_accumulate() {
        let locks = ReleaseLocks::new();
        for i in 0..200 {
            let _g = locks
                .acquire(LockKey::release(format!("ml-job-{}", i), "ns-a", "ctx-1"))
                .await;
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn entry_survives_while_a_waiter_is_queued() {
        let locks = Arc::new(ReleaseLocks::new());
        let key = LockKey::release("ml-job-1", "ns-a", "ctx-1");
        let held = locks.acquire(key.clone()).await;

        let locks2 = locks.clone();
        let key2 = key.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let waiter = tokio::spawn(async move {
            let g = locks2.acquire(key2).await;
            rx.await.unwrap();
            drop(g);
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(held);
        tokio::time::sleep(Duration::from_millis(20)).await;
        // the waiter now holds the same mutex, so the entry is still there
        assert_eq!(locks.len(), 1);

        tx.send(()).unwrap();
        waiter.await.unwrap();
        assert!(locks.is_empty());
    }
}
