//! In-memory content directory.
//!
//! Tracks size, last-access time, and replica count for every stored hash,
//! keyed by short hash. Mutations of a given entry are serialized externally
//! by the hash lock set; the directory itself only guarantees that each
//! individual operation is atomic.

use std::collections::{BinaryHeap, HashMap};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use hoard_hash::{ContentHash, HashAlgorithm, ShortHash, DIGEST_LEN};

use crate::clock::Clock;
use crate::error::{Result, StoreError};
use crate::layout::ScannedBlob;

/// Snapshot file magic.
const SNAPSHOT_MAGIC: [u8; 4] = *b"HORD";

/// Snapshot format version. Readers reject anything else and the caller
/// falls back to reconstruction.
const SNAPSHOT_VERSION: u32 = 1;

/// Serialized size of one snapshot record.
const RECORD_LEN: usize = 1 + DIGEST_LEN + 8 + 8 + 4;

/// Attributes of one stored hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentFileInfo {
    /// Size in bytes of one replica.
    pub file_size: u64,
    /// Last access in file-time ticks. Refreshed on read, put, place, pin.
    pub last_access_ticks: i64,
    /// Number of on-disk replicas. At least 1 while the entry exists.
    pub replica_count: u32,
}

impl ContentFileInfo {
    /// Total bytes this hash occupies across all replicas.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.file_size * u64::from(self.replica_count)
    }
}

#[derive(Debug, Clone)]
struct DirectoryEntry {
    hash: ContentHash,
    info: ContentFileInfo,
}

/// Concurrent mapping from short hash to content attributes.
pub struct ContentDirectory {
    entries: RwLock<HashMap<ShortHash, DirectoryEntry>>,
    clock: Arc<dyn Clock>,
}

impl ContentDirectory {
    /// Creates an empty directory.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Looks up a hash without touching its access time.
    pub async fn get(&self, hash: &ContentHash) -> Option<ContentFileInfo> {
        self.entries.read().await.get(&hash.short()).map(|e| e.info)
    }

    /// Atomically reads, transforms, and writes back one entry.
    ///
    /// `f` receives the current info (or `None`) and its return value
    /// replaces the entry; returning `None` removes it. With `touch`, the
    /// access time is refreshed before `f` runs, but only if the entry
    /// exists. Returns the state after the update.
    pub async fn update<F>(&self, hash: &ContentHash, touch: bool, f: F) -> Option<ContentFileInfo>
    where
        F: FnOnce(Option<ContentFileInfo>) -> Option<ContentFileInfo>,
    {
        let mut entries = self.entries.write().await;
        let key = hash.short();

        let mut current = entries.get(&key).map(|e| e.info);
        if touch {
            if let Some(info) = current.as_mut() {
                info.last_access_ticks = self.clock.now_ticks();
            }
        }

        match f(current) {
            Some(info) => {
                entries.insert(key, DirectoryEntry { hash: *hash, info });
                Some(info)
            }
            None => {
                entries.remove(&key);
                None
            }
        }
    }

    /// Refreshes an entry's access time, if it exists. Returns the entry.
    pub async fn touch(&self, hash: &ContentHash) -> Option<ContentFileInfo> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&hash.short())?;
        entry.info.last_access_ticks = self.clock.now_ticks();
        Some(entry.info)
    }

    /// Number of distinct hashes.
    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Total bytes across all entries and replicas.
    pub async fn total_size(&self) -> u64 {
        self.entries
            .read()
            .await
            .values()
            .map(|e| e.info.total_size())
            .sum()
    }

    /// Snapshot of all hashes.
    pub async fn snapshot_hashes(&self) -> Vec<ContentHash> {
        self.entries.read().await.values().map(|e| e.hash).collect()
    }

    /// Snapshot of all entries.
    pub async fn snapshot_info(&self) -> Vec<(ContentHash, ContentFileInfo)> {
        self.entries
            .read()
            .await
            .values()
            .map(|e| (e.hash, e.info))
            .collect()
    }

    /// All entries ordered by last access, least recent first.
    ///
    /// The snapshot is taken under the read lock; touches racing with the
    /// enumeration may or may not be reflected.
    pub async fn lru_snapshot(&self) -> Vec<(ContentHash, ContentFileInfo)> {
        let mut all = self.snapshot_info().await;
        all.sort_by_key(|(_, info)| info.last_access_ticks);
        all
    }

    /// The `n` least recently used entries, cheapest first, without
    /// sorting the whole directory.
    pub async fn lru_oldest(&self, n: usize) -> Vec<(ContentHash, ContentFileInfo)> {
        if n == 0 {
            return Vec::new();
        }

        let entries = self.entries.read().await;
        let mut heap: BinaryHeap<HeapItem> = BinaryHeap::with_capacity(n + 1);
        for entry in entries.values() {
            heap.push(HeapItem {
                hash: entry.hash,
                info: entry.info,
            });
            if heap.len() > n {
                heap.pop(); // discard the most recently used of the kept set
            }
        }
        drop(entries);

        let mut oldest: Vec<_> = heap.into_iter().map(|i| (i.hash, i.info)).collect();
        oldest.sort_by_key(|(_, info)| info.last_access_ticks);
        oldest
    }

    /// Rebuilds the directory from a shared-directory scan.
    ///
    /// Blobs are grouped by hash; the group size becomes the replica count
    /// and the primary's size (any member's, they are byte-identical) the
    /// file size. Access times restart at now.
    pub async fn reconstruct(&self, blobs: &[ScannedBlob]) {
        let now = self.clock.now_ticks();
        let mut grouped: HashMap<ShortHash, DirectoryEntry> = HashMap::new();

        for blob in blobs {
            grouped
                .entry(blob.hash.short())
                .and_modify(|e| e.info.replica_count += 1)
                .or_insert(DirectoryEntry {
                    hash: blob.hash,
                    info: ContentFileInfo {
                        file_size: blob.size,
                        last_access_ticks: now,
                        replica_count: 1,
                    },
                });
        }

        let count = grouped.len();
        *self.entries.write().await = grouped;
        info!(entries = count, "Content directory reconstructed from disk");
    }

    /// Serializes the directory to its snapshot file, staging through a
    /// sibling temp file and renaming into place.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let entries = self.snapshot_info().await;

        let mut buf = Vec::with_capacity(16 + entries.len() * RECORD_LEN);
        buf.extend_from_slice(&SNAPSHOT_MAGIC);
        buf.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        buf.extend_from_slice(&(entries.len() as u64).to_le_bytes());

        for (hash, info) in &entries {
            buf.push(algorithm_tag(hash.algorithm()));
            buf.extend_from_slice(hash.digest());
            buf.extend_from_slice(&info.file_size.to_le_bytes());
            buf.extend_from_slice(&info.last_access_ticks.to_le_bytes());
            buf.extend_from_slice(&info.replica_count.to_le_bytes());
        }

        let temp = path.with_extension("tmp");
        let mut file = std::fs::File::create(&temp)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&temp, path)?;

        debug!(entries = entries.len(), path = %path.display(), "Content directory persisted");
        Ok(())
    }

    /// Loads entries from a snapshot file into this directory.
    ///
    /// Any structural problem yields `DirectoryFormat`; the store treats
    /// that as "reconstruct from disk", never as fatal.
    pub async fn load(&self, path: &Path) -> Result<usize> {
        let mut file = std::fs::File::open(path)?;
        let mut header = [0u8; 16];
        file.read_exact(&mut header)
            .map_err(|e| StoreError::DirectoryFormat(format!("short header: {e}")))?;

        if header[..4] != SNAPSHOT_MAGIC {
            return Err(StoreError::DirectoryFormat("bad magic".to_string()));
        }
        let version = u32::from_le_bytes(header[4..8].try_into().unwrap());
        if version != SNAPSHOT_VERSION {
            return Err(StoreError::DirectoryFormat(format!(
                "unsupported version {version}"
            )));
        }
        let count = u64::from_le_bytes(header[8..16].try_into().unwrap());

        let mut loaded = HashMap::with_capacity(count as usize);
        let mut record = [0u8; RECORD_LEN];
        for _ in 0..count {
            file.read_exact(&mut record)
                .map_err(|e| StoreError::DirectoryFormat(format!("truncated record: {e}")))?;

            let algorithm = algorithm_from_tag(record[0]).ok_or_else(|| {
                StoreError::DirectoryFormat(format!("unknown algorithm tag {}", record[0]))
            })?;
            let mut digest = [0u8; DIGEST_LEN];
            digest.copy_from_slice(&record[1..1 + DIGEST_LEN]);
            let hash = ContentHash::new(algorithm, digest);

            let base = 1 + DIGEST_LEN;
            let file_size = u64::from_le_bytes(record[base..base + 8].try_into().unwrap());
            let last_access_ticks =
                i64::from_le_bytes(record[base + 8..base + 16].try_into().unwrap());
            let replica_count =
                u32::from_le_bytes(record[base + 16..base + 20].try_into().unwrap());

            if replica_count == 0 {
                return Err(StoreError::DirectoryFormat(
                    "zero replica count in record".to_string(),
                ));
            }

            loaded.insert(
                hash.short(),
                DirectoryEntry {
                    hash,
                    info: ContentFileInfo {
                        file_size,
                        last_access_ticks,
                        replica_count,
                    },
                },
            );
        }

        let count = loaded.len();
        *self.entries.write().await = loaded;
        debug!(entries = count, path = %path.display(), "Content directory loaded");
        Ok(count)
    }
}

fn algorithm_tag(algorithm: HashAlgorithm) -> u8 {
    match algorithm {
        HashAlgorithm::Sha256 => 0,
        HashAlgorithm::Blake3 => 1,
    }
}

fn algorithm_from_tag(tag: u8) -> Option<HashAlgorithm> {
    match tag {
        0 => Some(HashAlgorithm::Sha256),
        1 => Some(HashAlgorithm::Blake3),
        _ => None,
    }
}

struct HeapItem {
    hash: ContentHash,
    info: ContentFileInfo,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.info.last_access_ticks == other.info.last_access_ticks && self.hash == other.hash
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.info
            .last_access_ticks
            .cmp(&other.info.last_access_ticks)
            .then_with(|| self.hash.cmp(&other.hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use hoard_hash::HashAlgorithm;

    fn hash_of(label: &str) -> ContentHash {
        let mut hasher = HashAlgorithm::Sha256.hasher();
        hasher.update(label.as_bytes());
        hasher.finalize()
    }

    fn directory() -> (ContentDirectory, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1000));
        (ContentDirectory::new(clock.clone()), clock)
    }

    fn info(size: u64, ticks: i64) -> ContentFileInfo {
        ContentFileInfo {
            file_size: size,
            last_access_ticks: ticks,
            replica_count: 1,
        }
    }

    #[tokio::test]
    async fn test_update_insert_get_remove() {
        let (dir, _) = directory();
        let hash = hash_of("a");

        assert!(dir.get(&hash).await.is_none());

        dir.update(&hash, false, |_| Some(info(42, 1000))).await;
        assert_eq!(dir.get(&hash).await.unwrap().file_size, 42);
        assert_eq!(dir.count().await, 1);
        assert_eq!(dir.total_size().await, 42);

        dir.update(&hash, false, |_| None).await;
        assert!(dir.get(&hash).await.is_none());
        assert_eq!(dir.count().await, 0);
    }

    #[tokio::test]
    async fn test_touch_only_applies_to_existing() {
        let (dir, clock) = directory();
        let hash = hash_of("a");

        // Touch on a missing entry must not materialize anything.
        let seen = dir
            .update(&hash, true, |current| {
                assert!(current.is_none());
                None
            })
            .await;
        assert!(seen.is_none());

        dir.update(&hash, false, |_| Some(info(1, 1000))).await;
        clock.advance(50);

        let updated = dir.update(&hash, true, |current| current).await.unwrap();
        assert_eq!(updated.last_access_ticks, 1050);
    }

    #[tokio::test]
    async fn test_total_size_counts_replicas() {
        let (dir, _) = directory();
        let hash = hash_of("a");

        dir.update(&hash, false, |_| {
            Some(ContentFileInfo {
                file_size: 10,
                last_access_ticks: 1000,
                replica_count: 3,
            })
        })
        .await;

        assert_eq!(dir.total_size().await, 30);
    }

    #[tokio::test]
    async fn test_lru_order() {
        let (dir, clock) = directory();
        let hashes: Vec<_> = ["a", "b", "c", "d"].iter().map(|l| hash_of(l)).collect();

        // Insert in one order, then touch in another.
        for hash in &hashes {
            clock.advance(1);
            dir.update(hash, false, |_| Some(info(1, clock.now_ticks())))
                .await;
        }
        clock.advance(10);
        dir.touch(&hashes[0]).await.unwrap();

        let lru = dir.lru_snapshot().await;
        let order: Vec<_> = lru.iter().map(|(h, _)| *h).collect();
        assert_eq!(order, vec![hashes[1], hashes[2], hashes[3], hashes[0]]);

        let oldest = dir.lru_oldest(2).await;
        assert_eq!(oldest.len(), 2);
        assert_eq!(oldest[0].0, hashes[1]);
        assert_eq!(oldest[1].0, hashes[2]);
    }

    #[tokio::test]
    async fn test_lru_oldest_larger_than_directory() {
        let (dir, _) = directory();
        dir.update(&hash_of("a"), false, |_| Some(info(1, 5))).await;

        let oldest = dir.lru_oldest(10).await;
        assert_eq!(oldest.len(), 1);
    }

    #[tokio::test]
    async fn test_reconstruct_groups_replicas() {
        let (dir, _) = directory();
        let layout = crate::layout::BlobLayout::new("/cache");
        let a = hash_of("a");
        let b = hash_of("b");

        let blobs = vec![
            ScannedBlob {
                hash: a,
                replica: 0,
                size: 100,
                path: layout.primary(&a),
            },
            ScannedBlob {
                hash: a,
                replica: 1,
                size: 100,
                path: layout.replica(&a, 1),
            },
            ScannedBlob {
                hash: b,
                replica: 0,
                size: 7,
                path: layout.primary(&b),
            },
        ];

        dir.reconstruct(&blobs).await;

        assert_eq!(dir.count().await, 2);
        let info_a = dir.get(&a).await.unwrap();
        assert_eq!(info_a.replica_count, 2);
        assert_eq!(info_a.file_size, 100);
        assert_eq!(dir.get(&b).await.unwrap().replica_count, 1);
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let (dir, _) = directory();
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("content.dir");

        for (i, label) in ["a", "b", "c"].iter().enumerate() {
            dir.update(&hash_of(label), false, |_| {
                Some(ContentFileInfo {
                    file_size: 10 * (i as u64 + 1),
                    last_access_ticks: 1000 + i as i64,
                    replica_count: i as u32 + 1,
                })
            })
            .await;
        }

        dir.save(&path).await.unwrap();

        let (restored, _) = directory();
        let loaded = restored.load(&path).await.unwrap();
        assert_eq!(loaded, 3);
        assert_eq!(restored.snapshot_info().await.len(), 3);
        assert_eq!(
            restored.get(&hash_of("c")).await.unwrap(),
            dir.get(&hash_of("c")).await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_load_rejects_bad_magic() {
        let (dir, _) = directory();
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("content.dir");
        std::fs::write(&path, b"NOPE????????????????").unwrap();

        let result = dir.load(&path).await;
        assert!(matches!(result, Err(StoreError::DirectoryFormat(_))));
    }

    #[tokio::test]
    async fn test_load_rejects_future_version() {
        let (dir, _) = directory();
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("content.dir");

        let mut buf = Vec::new();
        buf.extend_from_slice(&SNAPSHOT_MAGIC);
        buf.extend_from_slice(&99u32.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        std::fs::write(&path, &buf).unwrap();

        let result = dir.load(&path).await;
        assert!(matches!(result, Err(StoreError::DirectoryFormat(_))));
    }
}
