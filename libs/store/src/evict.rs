//! Eviction: removing content from the store.
//!
//! Eviction of one hash runs under its lock: the directory entry is
//! tentatively cleared, replicas are deleted (or kept, when still
//! hardlinked into build outputs and the caller asked to spare those),
//! survivors are renumbered contiguously, and the entry is rewritten if
//! anything survived. Deletion is best-effort; a file that will not die is
//! renamed into `temp/` and reaped at shutdown.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use hoard_hash::ContentHash;

use crate::announce::{ChangeAnnouncer, LocationStore};
use crate::cancel::CancellationToken;
use crate::directory::{ContentDirectory, ContentFileInfo};
use crate::error::Result;
use crate::fsio;
use crate::layout::BlobLayout;
use crate::locks::HashLockSet;
use crate::pin::PinRegistry;
use crate::quota::QuotaKeeper;

/// How many of the oldest entries a purge pass fetches before resorting
/// to a full LRU ordering.
const PURGE_BATCH: usize = 64;

/// Knobs for a single eviction.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvictOptions {
    /// Remove the content even if pinned.
    pub force: bool,
    /// Keep replicas whose external hardlink count shows them still in
    /// use; only unreferenced replicas go.
    pub only_unlinked: bool,
}

/// What an eviction accomplished.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvictOutcome {
    /// Bytes actually freed.
    pub evicted_size: u64,
    /// Replica files actually removed.
    pub evicted_files: u32,
    /// Total size of the content when a pin prevented eviction, else 0.
    pub pinned_size: u64,
    /// The hash is fully gone from directory and disk.
    pub evicted: bool,
}

/// Eviction engine.
pub struct EvictionEngine {
    layout: Arc<BlobLayout>,
    directory: Arc<ContentDirectory>,
    locks: Arc<HashLockSet>,
    pins: Arc<PinRegistry>,
    quota: Arc<QuotaKeeper>,
    announcer: Arc<dyn ChangeAnnouncer>,
    location: Option<Arc<dyn LocationStore>>,
    evicted_files_total: AtomicU64,
}

impl EvictionEngine {
    pub(crate) fn new(
        layout: Arc<BlobLayout>,
        directory: Arc<ContentDirectory>,
        locks: Arc<HashLockSet>,
        pins: Arc<PinRegistry>,
        quota: Arc<QuotaKeeper>,
        announcer: Arc<dyn ChangeAnnouncer>,
        location: Option<Arc<dyn LocationStore>>,
    ) -> Self {
        Self {
            layout,
            directory,
            locks,
            pins,
            quota,
            announcer,
            location,
            evicted_files_total: AtomicU64::new(0),
        }
    }

    /// Evicts one hash, waiting for its lock.
    pub async fn evict(&self, hash: &ContentHash, options: EvictOptions) -> Result<EvictOutcome> {
        let guard = self.locks.acquire(hash).await;
        let outcome = self.evict_locked(hash, options).await?;
        drop(guard);

        self.announce(hash, &outcome).await;
        Ok(outcome)
    }

    /// Evicts one hash only if its lock is immediately free. A contended
    /// lock means someone is actively using the content; the purge loop
    /// moves on rather than stalling behind them.
    pub async fn try_evict(
        &self,
        hash: &ContentHash,
        options: EvictOptions,
    ) -> Result<EvictOutcome> {
        let Some(guard) = self.locks.try_acquire(hash) else {
            return Ok(EvictOutcome::default());
        };

        let outcome = self.evict_locked(hash, options).await?;
        drop(guard);

        self.announce(hash, &outcome).await;
        Ok(outcome)
    }

    /// Removes a hash unconditionally: all replicas, pins notwithstanding.
    pub async fn delete(&self, hash: &ContentHash) -> Result<EvictOutcome> {
        self.evict(
            hash,
            EvictOptions {
                force: true,
                only_unlinked: false,
            },
        )
        .await
    }

    /// Evicts LRU-ordered content until the committed total drops to
    /// `target` bytes or candidates run out. Returns bytes freed.
    ///
    /// A `force` pass (requested by a force-tagged reservation) may also
    /// reclaim pinned content.
    pub async fn purge_to(
        &self,
        target: u64,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut freed = 0u64;

        // Cheap pass over the oldest few first; only fall back to ordering
        // the whole directory if that was not enough.
        let batches = [
            self.directory.lru_oldest(PURGE_BATCH).await,
            self.directory.lru_snapshot().await,
        ];

        'outer: for batch in batches {
            for (hash, _) in batch {
                if self.quota.current_bytes() <= target {
                    break 'outer;
                }
                if cancel.is_cancelled() {
                    break 'outer;
                }
                if !force && self.pins.is_pinned(&hash) {
                    continue;
                }

                let outcome = self
                    .try_evict(
                        &hash,
                        EvictOptions {
                            force,
                            only_unlinked: false,
                        },
                    )
                    .await?;
                freed += outcome.evicted_size;
            }

            if self.quota.current_bytes() <= target {
                break;
            }
        }

        if freed > 0 {
            info!(
                freed_bytes = freed,
                current_bytes = self.quota.current_bytes(),
                target_bytes = target,
                "Purge pass finished"
            );
        }
        Ok(freed)
    }

    /// Cumulative count of replica files removed.
    pub fn evicted_files_total(&self) -> u64 {
        self.evicted_files_total.load(Ordering::Relaxed)
    }

    /// The eviction body. The caller holds the hash lock.
    pub(crate) async fn evict_locked(
        &self,
        hash: &ContentHash,
        options: EvictOptions,
    ) -> Result<EvictOutcome> {
        let Some(info) = self.directory.get(hash).await else {
            // Nothing to do; the hash is already gone.
            return Ok(EvictOutcome {
                evicted: true,
                ..Default::default()
            });
        };

        if !options.force && self.pins.is_pinned(hash) {
            return Ok(EvictOutcome {
                pinned_size: info.total_size(),
                ..Default::default()
            });
        }

        // Tentatively gone; survivors are written back below.
        self.directory.update(hash, false, |_| None).await;

        let mut survivors: Vec<PathBuf> = Vec::new();
        let mut evicted_size = 0u64;
        let mut evicted_files = 0u32;

        for n in 0..info.replica_count {
            let path = self.layout.replica(hash, n);

            if options.only_unlinked {
                match fsio::link_count(&path) {
                    Ok(count) if count > 1 => {
                        survivors.push(path);
                        continue;
                    }
                    _ => {}
                }
            }

            match fsio::remove_blob(&path) {
                Ok(()) => {
                    evicted_size += info.file_size;
                    evicted_files += 1;
                    self.quota.on_evicted(info.file_size);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // The replica was already missing; nothing freed.
                }
                Err(e) => {
                    // Park the stubborn file in temp/ for shutdown reaping.
                    let quarantine = self.layout.temp_file();
                    if std::fs::rename(&path, &quarantine).is_ok() {
                        debug!(path = %path.display(), "Quarantined undeletable replica");
                        evicted_size += info.file_size;
                        evicted_files += 1;
                        self.quota.on_evicted(info.file_size);
                    } else {
                        warn!(path = %path.display(), error = %e, "Replica could not be evicted");
                        survivors.push(path);
                    }
                }
            }
        }

        self.evicted_files_total
            .fetch_add(u64::from(evicted_files), Ordering::Relaxed);

        if survivors.is_empty() {
            debug!(hash = %hash, freed = evicted_size, "Content evicted");
            return Ok(EvictOutcome {
                evicted_size,
                evicted_files,
                pinned_size: 0,
                evicted: true,
            });
        }

        // Renumber the kept replicas into a contiguous range and rewrite
        // the entry to match.
        for (index, path) in survivors.iter().enumerate() {
            let target = self.layout.replica(hash, index as u32);
            if *path != target {
                if let Err(e) = std::fs::rename(path, &target) {
                    warn!(
                        from = %path.display(),
                        to = %target.display(),
                        error = %e,
                        "Replica renumbering failed; self-check will repair"
                    );
                }
            }
        }

        let replica_count = survivors.len() as u32;
        self.directory
            .update(hash, false, |_| {
                Some(ContentFileInfo {
                    file_size: info.file_size,
                    last_access_ticks: info.last_access_ticks,
                    replica_count,
                })
            })
            .await;

        debug!(
            hash = %hash,
            kept = replica_count,
            freed = evicted_size,
            "Partial eviction kept linked replicas"
        );
        Ok(EvictOutcome {
            evicted_size,
            evicted_files,
            pinned_size: 0,
            evicted: false,
        })
    }

    /// Announces an eviction outcome. Call with no hash lock held.
    ///
    /// Evicting a hash that was already absent announces nothing.
    pub(crate) async fn announce(&self, hash: &ContentHash, outcome: &EvictOutcome) {
        if outcome.evicted_files == 0 {
            return;
        }

        self.announcer
            .content_evicted(*hash, outcome.evicted_size)
            .await;

        if outcome.evicted {
            if let Some(location) = &self.location {
                location.unregister(std::slice::from_ref(hash)).await;
            }
        }
    }
}
