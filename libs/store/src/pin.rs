//! Pin reference counts and pin contexts.
//!
//! A pin is a reference count that shields content from non-forced
//! eviction. Pins are taken through a [`PinContext`]: an owning handle that
//! records its own increments and gives them all back when disposed. Many
//! contexts may pin the same hash; the global count is the sum.
//!
//! The registry also tracks the high-water mark of pinned bytes across a
//! "pin batch" (the lifetime of at least one live context) and feeds it
//! into a small on-disk history ring the quota planner reads at startup.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use tracing::debug;

use hoard_hash::{ContentHash, ShortHash};

use crate::locks::HashLockSet;

/// An owning handle over a set of pin increments.
///
/// Active from creation until passed to [`PinRegistry::dispose`].
#[derive(Debug)]
pub struct PinContext {
    id: u64,
    increments: Mutex<HashMap<ShortHash, u64>>,
}

impl PinContext {
    /// Stable id for logging.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether this context has pinned the given hash.
    pub fn holds(&self, hash: &ContentHash) -> bool {
        hash.is_empty_content()
            || self
                .increments
                .lock()
                .unwrap()
                .get(&hash.short())
                .is_some_and(|n| *n > 0)
    }
}

#[derive(Debug, Default)]
struct PinEntry {
    count: u64,
    bytes: u64,
}

#[derive(Debug, Default)]
struct PinState {
    counts: HashMap<ShortHash, PinEntry>,
    pinned_bytes: u64,
    batch_max_bytes: u64,
}

/// Global pin counters plus the pin-size history.
pub struct PinRegistry {
    state: Mutex<PinState>,
    history: Mutex<PinSizeHistory>,
    active_contexts: AtomicUsize,
    next_context_id: AtomicU64,
}

impl PinRegistry {
    /// Creates a registry with the given history ring.
    pub fn new(history: PinSizeHistory) -> Self {
        Self {
            state: Mutex::new(PinState::default()),
            history: Mutex::new(history),
            active_contexts: AtomicUsize::new(0),
            next_context_id: AtomicU64::new(1),
        }
    }

    /// Creates a fresh pin context and opens a pin batch if none is live.
    pub fn create_context(&self) -> PinContext {
        self.active_contexts.fetch_add(1, Ordering::SeqCst);
        PinContext {
            id: self.next_context_id.fetch_add(1, Ordering::Relaxed),
            increments: Mutex::new(HashMap::new()),
        }
    }

    /// Adds one pin for a hash through a context. Callers hold the hash
    /// lock. `total_size` is the hash's current on-disk footprint.
    ///
    /// The empty-content hash needs no bookkeeping and is ignored.
    pub fn pin(&self, hash: &ContentHash, total_size: u64, context: &PinContext) {
        if hash.is_empty_content() {
            return;
        }

        let key = hash.short();
        {
            let mut state = self.state.lock().unwrap();
            let entry = state.counts.entry(key).or_default();
            entry.count += 1;
            entry.bytes = total_size;
            if entry.count == 1 {
                state.pinned_bytes += total_size;
            }
            state.batch_max_bytes = state.batch_max_bytes.max(state.pinned_bytes);
        }

        *context.increments.lock().unwrap().entry(key).or_insert(0) += 1;
    }

    /// Whether a hash has any pins. The empty-content hash is always
    /// pinned.
    pub fn is_pinned(&self, hash: &ContentHash) -> bool {
        hash.is_empty_content()
            || self
                .state
                .lock()
                .unwrap()
                .counts
                .get(&hash.short())
                .is_some_and(|e| e.count > 0)
    }

    /// Total bytes currently shielded by pins.
    pub fn pinned_bytes(&self) -> u64 {
        self.state.lock().unwrap().pinned_bytes
    }

    /// Asserts that a hash is pinned, and that the given context
    /// contributed a pin. A failure here is a broken caller invariant, not
    /// a runtime condition, so it aborts.
    pub fn verify_pinned(&self, hash: &ContentHash, context: Option<&PinContext>) {
        if !self.is_pinned(hash) {
            panic!("pin invariant violated: {hash} is not pinned");
        }
        if let Some(context) = context {
            if !context.holds(hash) {
                panic!(
                    "pin invariant violated: context {} holds no pin for {hash}",
                    context.id
                );
            }
        }
    }

    /// Releases every pin a context holds, each under its hash's lock.
    ///
    /// Closing the last live context ends the pin batch: the batch's
    /// pinned-bytes high-water mark is pushed into the history ring.
    pub async fn dispose(&self, context: PinContext, locks: &HashLockSet) {
        let increments: Vec<(ShortHash, u64)> = context
            .increments
            .lock()
            .unwrap()
            .drain()
            .collect();

        for (key, decrement) in increments {
            let _guard = locks.acquire_short(key).await;
            let mut state = self.state.lock().unwrap();
            if let Some(entry) = state.counts.get_mut(&key) {
                entry.count = entry.count.saturating_sub(decrement);
                if entry.count == 0 {
                    let bytes = entry.bytes;
                    state.counts.remove(&key);
                    state.pinned_bytes = state.pinned_bytes.saturating_sub(bytes);
                }
            }
        }

        if self.active_contexts.fetch_sub(1, Ordering::SeqCst) == 1 {
            let batch_max = {
                let mut state = self.state.lock().unwrap();
                let max = state.batch_max_bytes;
                state.batch_max_bytes = state.pinned_bytes;
                max
            };
            self.history.lock().unwrap().push(batch_max);
            debug!(id = context.id, batch_max_bytes = batch_max, "Pin batch closed");
        }
    }

    /// Largest pinned footprint seen across recorded batches.
    pub fn history_max(&self) -> u64 {
        self.history.lock().unwrap().max()
    }

    /// Persists the history ring.
    pub fn save_history(&self, path: &Path) -> io::Result<()> {
        self.history.lock().unwrap().save(path)
    }
}

/// Fixed-size ring of pin-batch size high-water marks.
///
/// On disk this is nothing but a sequence of 64-bit little-endian
/// integers, rewritten in place; sample order does not matter to the quota
/// planner.
#[derive(Debug, Clone)]
pub struct PinSizeHistory {
    slots: Vec<u64>,
    cursor: usize,
    window: usize,
}

impl PinSizeHistory {
    /// Creates an empty history with the given window.
    pub fn new(window: usize) -> Self {
        Self {
            slots: Vec::with_capacity(window),
            cursor: 0,
            window: window.max(1),
        }
    }

    /// Loads a history from disk, tolerating a missing file.
    pub fn load(path: &Path, window: usize) -> io::Result<Self> {
        let mut history = Self::new(window);

        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(history),
            Err(e) => return Err(e),
        };

        for chunk in bytes.chunks_exact(8).take(history.window) {
            history.slots.push(u64::from_le_bytes(chunk.try_into().unwrap()));
        }
        history.cursor = history.slots.len() % history.window;
        Ok(history)
    }

    /// Writes the ring back to disk.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let mut buf = Vec::with_capacity(self.slots.len() * 8);
        for value in &self.slots {
            buf.extend_from_slice(&value.to_le_bytes());
        }
        std::fs::write(path, buf)
    }

    /// Records a sample, overwriting the oldest once the window is full.
    pub fn push(&mut self, value: u64) {
        if self.slots.len() < self.window {
            self.slots.push(value);
        } else {
            self.slots[self.cursor] = value;
        }
        self.cursor = (self.cursor + 1) % self.window;
    }

    /// Largest recorded sample.
    pub fn max(&self) -> u64 {
        self.slots.iter().copied().max().unwrap_or(0)
    }

    /// Recorded samples, in no particular order.
    pub fn values(&self) -> &[u64] {
        &self.slots
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

    fn registry() -> PinRegistry {
        PinRegistry::new(PinSizeHistory::new(4))
    }

    #[tokio::test]
    async fn test_pin_and_dispose() {
        let registry = registry();
        let locks = HashLockSet::new();
        let hash = hash_of("a");

        let context = registry.create_context();
        assert!(!registry.is_pinned(&hash));

        registry.pin(&hash, 100, &context);
        assert!(registry.is_pinned(&hash));
        assert!(context.holds(&hash));
        assert_eq!(registry.pinned_bytes(), 100);

        registry.dispose(context, &locks).await;
        assert!(!registry.is_pinned(&hash));
        assert_eq!(registry.pinned_bytes(), 0);
    }

    #[tokio::test]
    async fn test_independent_contexts_stack() {
        let registry = registry();
        let locks = HashLockSet::new();
        let hash = hash_of("a");

        let first = registry.create_context();
        let second = registry.create_context();
        registry.pin(&hash, 10, &first);
        registry.pin(&hash, 10, &second);

        registry.dispose(first, &locks).await;
        assert!(registry.is_pinned(&hash), "second context still pins");

        registry.dispose(second, &locks).await;
        assert!(!registry.is_pinned(&hash));
    }

    #[tokio::test]
    async fn test_batch_high_water_mark_recorded() {
        let registry = registry();
        let locks = HashLockSet::new();

        let context = registry.create_context();
        registry.pin(&hash_of("a"), 100, &context);
        registry.pin(&hash_of("b"), 50, &context);
        assert_eq!(registry.pinned_bytes(), 150);

        registry.dispose(context, &locks).await;
        assert_eq!(registry.history_max(), 150);
    }

    #[test]
    fn test_empty_hash_always_pinned() {
        let registry = registry();
        let empty = ContentHash::empty(HashAlgorithm::Sha256);

        assert!(registry.is_pinned(&empty));

        let context = registry.create_context();
        registry.pin(&empty, 0, &context);
        assert_eq!(registry.pinned_bytes(), 0, "empty hash has no bookkeeping");
        registry.verify_pinned(&empty, Some(&context));
    }

    #[test]
    #[should_panic(expected = "pin invariant violated")]
    fn test_verify_unpinned_panics() {
        let registry = registry();
        registry.verify_pinned(&hash_of("a"), None);
    }

    #[test]
    #[should_panic(expected = "holds no pin")]
    fn test_verify_foreign_context_panics() {
        let registry = registry();
        let owner = registry.create_context();
        let other = registry.create_context();
        registry.pin(&hash_of("a"), 1, &owner);
        registry.verify_pinned(&hash_of("a"), Some(&other));
    }

    #[test]
    fn test_history_ring_wraps() {
        let mut history = PinSizeHistory::new(3);
        for v in [1, 2, 3, 4] {
            history.push(v);
        }
        assert_eq!(history.values().len(), 3);
        assert_eq!(history.max(), 4);
        assert!(!history.values().contains(&1), "oldest sample overwritten");
    }

    #[test]
    fn test_history_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pins.ring");

        let mut history = PinSizeHistory::new(4);
        history.push(10);
        history.push(20);
        history.save(&path).unwrap();

        let restored = PinSizeHistory::load(&path, 4).unwrap();
        assert_eq!(restored.max(), 20);
        assert_eq!(restored.values().len(), 2);

        let missing = PinSizeHistory::load(&dir.path().join("absent"), 4).unwrap();
        assert_eq!(missing.values(), &[] as &[u64]);
    }
}
