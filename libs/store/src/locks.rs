//! Per-hash advisory locks.
//!
//! Every mutating operation on a hash (directory entry, pin count, replica
//! files) runs under that hash's lock. The table is segmented: a fixed
//! shard array keyed by a stable hash of the short hash, so acquiring one
//! hash never contends on a global structure. Entries are dropped when the
//! last guard goes away.
//!
//! Reentrancy is not supported; callers must never re-acquire a hash they
//! already hold, transitively or otherwise.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use hoard_hash::{ContentHash, ShortHash};

/// Number of shards in the lock table.
const SHARD_COUNT: usize = 64;

type Shard = Mutex<HashMap<ShortHash, Arc<AsyncMutex<()>>>>;

/// Segmented per-hash lock table.
pub struct HashLockSet {
    shards: Arc<[Shard]>,
    total_wait_micros: AtomicU64,
}

impl HashLockSet {
    /// Creates an empty lock set.
    pub fn new() -> Self {
        let shards: Vec<Shard> = (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            shards: shards.into(),
            total_wait_micros: AtomicU64::new(0),
        }
    }

    /// Acquires the lock for a hash, waiting if it is contended.
    pub async fn acquire(&self, hash: &ContentHash) -> HashGuard {
        self.acquire_short(hash.short()).await
    }

    /// Acquires the lock for a short hash.
    pub async fn acquire_short(&self, key: ShortHash) -> HashGuard {
        let started = Instant::now();
        let lock = self.entry(key);
        let guard = lock.clone().lock_owned().await;

        let waited = started.elapsed();
        self.total_wait_micros
            .fetch_add(waited.as_micros() as u64, Ordering::Relaxed);

        HashGuard {
            shards: Arc::clone(&self.shards),
            key,
            lock,
            guard: Some(guard),
            waited,
        }
    }

    /// Acquires the lock only if it is immediately free.
    pub fn try_acquire(&self, hash: &ContentHash) -> Option<HashGuard> {
        let key = hash.short();
        let lock = self.entry(key);
        let guard = lock.clone().try_lock_owned().ok()?;

        Some(HashGuard {
            shards: Arc::clone(&self.shards),
            key,
            lock,
            guard: Some(guard),
            waited: Duration::ZERO,
        })
    }

    /// Cumulative time all acquisitions have spent waiting.
    pub fn total_wait(&self) -> Duration {
        Duration::from_micros(self.total_wait_micros.load(Ordering::Relaxed))
    }

    /// Number of hashes currently holding a table entry.
    pub fn active_locks(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().len()).sum()
    }

    fn entry(&self, key: ShortHash) -> Arc<AsyncMutex<()>> {
        let shard = &self.shards[shard_index(key)];
        let mut map = shard.lock().unwrap();
        map.entry(key)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

impl Default for HashLockSet {
    fn default() -> Self {
        Self::new()
    }
}

fn shard_index(key: ShortHash) -> usize {
    key.shard_seed() as usize % SHARD_COUNT
}

/// Holds one hash's lock until dropped.
pub struct HashGuard {
    shards: Arc<[Shard]>,
    key: ShortHash,
    lock: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
    waited: Duration,
}

impl HashGuard {
    /// How long the acquisition waited for a contended lock.
    pub fn waited(&self) -> Duration {
        self.waited
    }

    /// The short hash this guard serializes.
    pub fn key(&self) -> ShortHash {
        self.key
    }
}

impl Drop for HashGuard {
    fn drop(&mut self) {
        // Release the mutex first, then retire the table entry if nobody
        // else holds or awaits it: the remaining strong counts are the
        // table's and ours.
        self.guard.take();

        let mut map = self.shards[shard_index(self.key)].lock().unwrap();
        if Arc::strong_count(&self.lock) == 2 {
            map.remove(&self.key);
        }
    }
}

impl std::fmt::Debug for HashGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashGuard").field("key", &self.key).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hoard_hash::HashAlgorithm;

    fn hash_of(label: &str) -> ContentHash {
        let mut hasher = HashAlgorithm::Sha256.hasher();
        hasher.update(label.as_bytes());
        hasher.finalize()
    }

    #[tokio::test]
    async fn test_acquire_release_cleans_table() {
        let locks = HashLockSet::new();
        let hash = hash_of("a");

        let guard = locks.acquire(&hash).await;
        assert_eq!(locks.active_locks(), 1);
        drop(guard);
        assert_eq!(locks.active_locks(), 0);
    }

    #[tokio::test]
    async fn test_try_acquire_contended() {
        let locks = HashLockSet::new();
        let hash = hash_of("a");

        let held = locks.acquire(&hash).await;
        assert!(locks.try_acquire(&hash).is_none());
        drop(held);
        assert!(locks.try_acquire(&hash).is_some());
    }

    #[tokio::test]
    async fn test_distinct_hashes_do_not_contend() {
        let locks = HashLockSet::new();

        let _a = locks.acquire(&hash_of("a")).await;
        let b = locks.try_acquire(&hash_of("b"));
        assert!(b.is_some());
    }

    #[tokio::test]
    async fn test_contended_acquire_waits_then_succeeds() {
        let locks = Arc::new(HashLockSet::new());
        let hash = hash_of("a");

        let guard = locks.acquire(&hash).await;

        let locks2 = Arc::clone(&locks);
        let waiter = tokio::spawn(async move {
            let _guard = locks2.acquire(&hash).await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(guard);

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should acquire after release")
            .unwrap();
        assert!(locks.total_wait() >= Duration::from_millis(5));
    }
}
