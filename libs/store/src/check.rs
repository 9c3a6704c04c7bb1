//! Self-check: revalidating disk against the directory.
//!
//! The checker walks the shared tree, rehashes every blob, and compares
//! the result to the hash its path encodes. Files that lie about their
//! content (or are not blobs at all) are quarantined into `temp/` for
//! shutdown reaping. Afterwards the directory is reconciled both ways:
//! content on disk but unknown to the directory is re-added, entries with
//! no files behind them are dropped, and replica numbering holes left by
//! quarantines are closed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use hoard_hash::{hash_file, ContentHash, ShortHash};

use crate::cancel::CancellationToken;
use crate::clock::Clock;
use crate::directory::{ContentDirectory, ContentFileInfo};
use crate::error::Result;
use crate::layout::BlobLayout;
use crate::locks::HashLockSet;
use crate::quota::QuotaKeeper;

/// What one self-check pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelfCheckReport {
    /// Files inspected under the shared tree.
    pub scanned: u64,
    /// Hashes present on disk but missing from the directory, now re-added.
    pub readded: u64,
    /// Directory entries with no disk backing, now removed.
    pub removed_entries: u64,
    /// Mismatched or foreign files moved to temp.
    pub quarantined: u64,
}

/// Revalidates on-disk blobs against the directory.
pub struct SelfChecker {
    layout: Arc<BlobLayout>,
    directory: Arc<ContentDirectory>,
    locks: Arc<HashLockSet>,
    quota: Arc<QuotaKeeper>,
    clock: Arc<dyn Clock>,
    mismatches_total: AtomicU64,
}

struct SurvivingGroup {
    hash: ContentHash,
    file_size: u64,
    /// Replica indices observed on disk, unsorted.
    indices: Vec<(u32, PathBuf)>,
}

impl SelfChecker {
    pub(crate) fn new(
        layout: Arc<BlobLayout>,
        directory: Arc<ContentDirectory>,
        locks: Arc<HashLockSet>,
        quota: Arc<QuotaKeeper>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            layout,
            directory,
            locks,
            quota,
            clock,
            mismatches_total: AtomicU64::new(0),
        }
    }

    /// Cumulative count of content mismatches found across all runs.
    pub fn mismatches_total(&self) -> u64 {
        self.mismatches_total.load(Ordering::Relaxed)
    }

    /// Runs one full check pass.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<SelfCheckReport> {
        let mut report = SelfCheckReport::default();
        let mut groups: HashMap<ShortHash, SurvivingGroup> = HashMap::new();

        for path in self.all_shared_files()? {
            if cancel.is_cancelled() {
                return Err(crate::error::StoreError::Cancelled);
            }
            report.scanned += 1;

            let (Some(claimed), Some(index)) =
                (self.layout.parse(&path), self.layout.replica_index(&path))
            else {
                debug!(path = %path.display(), "Quarantining foreign file in shared tree");
                self.quarantine(&path, &mut report);
                continue;
            };

            let verified = match hash_file(claimed.algorithm(), &path) {
                Ok((computed, size)) if computed == claimed => Some(size),
                Ok((computed, _)) => {
                    warn!(
                        path = %path.display(),
                        expected = %claimed,
                        actual = %computed,
                        "Blob content does not match its name"
                    );
                    self.mismatches_total.fetch_add(1, Ordering::Relaxed);
                    None
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Blob unreadable during self-check");
                    None
                }
            };

            let Some(size) = verified else {
                self.quarantine(&path, &mut report);
                continue;
            };

            groups
                .entry(claimed.short())
                .and_modify(|g| g.indices.push((index, path.clone())))
                .or_insert_with(|| SurvivingGroup {
                    hash: claimed,
                    file_size: size,
                    indices: vec![(index, path)],
                });
        }

        // Reconcile each surviving on-disk group under its hash lock:
        // close numbering holes, then make the directory agree.
        for (_, mut group) in groups.drain() {
            if cancel.is_cancelled() {
                return Err(crate::error::StoreError::Cancelled);
            }

            let _guard = self.locks.acquire(&group.hash).await;
            self.renumber(&mut group);

            let replica_count = group.indices.len() as u32;
            let file_size = group.file_size;
            let now = self.clock.now_ticks();

            let existed = self.directory.get(&group.hash).await.is_some();
            self.directory
                .update(&group.hash, true, |current| match current {
                    Some(mut info) => {
                        info.replica_count = replica_count;
                        info.file_size = file_size;
                        Some(info)
                    }
                    None => Some(ContentFileInfo {
                        file_size,
                        last_access_ticks: now,
                        replica_count,
                    }),
                })
                .await;

            if !existed {
                debug!(hash = %group.hash, replicas = replica_count, "Re-added content found on disk");
                report.readded += 1;
            }
        }

        // Directory entries with nothing on disk are stale.
        for hash in self.directory.snapshot_hashes().await {
            if cancel.is_cancelled() {
                return Err(crate::error::StoreError::Cancelled);
            }

            let _guard = self.locks.acquire(&hash).await;
            if !self.layout.primary(&hash).exists() {
                self.directory.update(&hash, false, |_| None).await;
                report.removed_entries += 1;
                debug!(hash = %hash, "Removed directory entry with no primary on disk");
            }
        }

        self.quota.calibrate(self.directory.total_size().await);

        info!(
            scanned = report.scanned,
            readded = report.readded,
            removed = report.removed_entries,
            quarantined = report.quarantined,
            "Self-check finished"
        );
        Ok(report)
    }

    /// Moves survivors into a contiguous 0..n numbering, primary first.
    fn renumber(&self, group: &mut SurvivingGroup) {
        group.indices.sort_by_key(|(index, _)| *index);

        for (slot, (index, path)) in group.indices.iter_mut().enumerate() {
            let slot = slot as u32;
            if *index == slot {
                continue;
            }
            let target = self.layout.replica(&group.hash, slot);
            match std::fs::rename(&*path, &target) {
                Ok(()) => {
                    *index = slot;
                    *path = target;
                }
                Err(e) => {
                    warn!(
                        from = %path.display(),
                        to = %target.display(),
                        error = %e,
                        "Replica renumbering failed during self-check"
                    );
                }
            }
        }
    }

    fn quarantine(&self, path: &PathBuf, report: &mut SelfCheckReport) {
        let quarantine = self.layout.temp_file();
        match std::fs::rename(path, &quarantine) {
            Ok(()) => report.quarantined += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "Quarantine failed"),
        }
    }

    /// Every regular file under the shared tree, well-formed or not.
    fn all_shared_files(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let shared = self.layout.shared_dir();
        if !shared.exists() {
            return Ok(files);
        }

        let mut stack = vec![shared];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if entry.file_type()?.is_dir() {
                    stack.push(path);
                } else {
                    files.push(path);
                }
            }
        }

        Ok(files)
    }
}
