//! Placement: materializing stored content at caller destinations.
//!
//! The fast realization is a hardlink from one of the hash's replicas.
//! A per-hash cursor remembers which replica last accepted a link so
//! successive placements do not probe from replica zero every time; when a
//! replica hits the OS link limit the cursor is cleared, a random other
//! replica is tried, and as a last resort the ingest engine mints a fresh
//! replica.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rand::Rng;
use tracing::{debug, warn};

use hoard_hash::{ContentHash, ShortHash};

use crate::cancel::CancellationToken;
use crate::clock::Clock;
use crate::directory::{ContentDirectory, ContentFileInfo};
use crate::error::{Result, StoreError};
use crate::evict::{EvictOptions, EvictionEngine};
use crate::fsio::{self, LinkError};
use crate::ingest::IngestEngine;
use crate::layout::BlobLayout;
use crate::locks::HashLockSet;
use crate::pin::{PinContext, PinRegistry};

/// Requested write access for the placed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// The caller only reads; the file may share the blob's inode.
    ReadOnly,
    /// The caller will write; the file must be a private copy.
    Write,
}

/// What to do when the destination already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacementMode {
    FailIfExists,
    SkipIfExists,
    ReplaceExisting,
}

/// How to realize the content at the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceRealization {
    /// Hardlink only; surfaces an error when impossible.
    HardLink,
    /// Plain copy.
    Copy,
    /// Copy, rehashing the bytes read and destroying the content locally
    /// on mismatch.
    CopyWithVerify,
    /// Hardlink when possible, copy otherwise.
    Any,
}

/// How a placement concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceCode {
    PlacedWithHardLink,
    PlacedWithCopy,
    NotPlacedAlreadyExists,
    NotPlacedContentNotFound,
}

/// Result of a placement.
#[derive(Debug, Clone, Copy)]
pub struct PlaceResult {
    pub code: PlaceCode,
    pub size: u64,
    pub last_access_ticks: i64,
}

impl PlaceResult {
    fn not_found() -> Self {
        Self {
            code: PlaceCode::NotPlacedContentNotFound,
            size: 0,
            last_access_ticks: 0,
        }
    }

    fn already_exists() -> Self {
        Self {
            code: PlaceCode::NotPlacedAlreadyExists,
            size: 0,
            last_access_ticks: 0,
        }
    }
}

/// Placement engine.
pub struct PlacementEngine {
    layout: Arc<BlobLayout>,
    directory: Arc<ContentDirectory>,
    locks: Arc<HashLockSet>,
    pins: Arc<PinRegistry>,
    ingest: Arc<IngestEngine>,
    eviction: Arc<EvictionEngine>,
    clock: Arc<dyn Clock>,
    /// Last replica that accepted a hardlink, per hash. In-memory only.
    cursors: Mutex<HashMap<ShortHash, u32>>,
    /// Per-inode link budget: configured, or learned from the first EMLINK
    /// (0 = unknown).
    link_limit: AtomicU64,
    use_hard_links: bool,
    apply_deny_writes: bool,
}

impl PlacementEngine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        layout: Arc<BlobLayout>,
        directory: Arc<ContentDirectory>,
        locks: Arc<HashLockSet>,
        pins: Arc<PinRegistry>,
        ingest: Arc<IngestEngine>,
        eviction: Arc<EvictionEngine>,
        clock: Arc<dyn Clock>,
        configured_link_limit: Option<u64>,
        use_hard_links: bool,
        apply_deny_writes: bool,
    ) -> Self {
        Self {
            layout,
            directory,
            locks,
            pins,
            ingest,
            eviction,
            clock,
            cursors: Mutex::new(HashMap::new()),
            link_limit: AtomicU64::new(configured_link_limit.unwrap_or(0)),
            use_hard_links,
            apply_deny_writes,
        }
    }

    /// Places stored content at `destination`.
    pub async fn place_file(
        &self,
        hash: &ContentHash,
        destination: &Path,
        access: AccessMode,
        replacement: ReplacementMode,
        realization: PlaceRealization,
        pin: Option<&PinContext>,
        cancel: &CancellationToken,
    ) -> Result<PlaceResult> {
        cancel.err_if_cancelled()?;

        if destination.exists() {
            match replacement {
                ReplacementMode::FailIfExists => {
                    return Err(StoreError::DestinationExists(destination.to_path_buf()));
                }
                ReplacementMode::SkipIfExists => return Ok(PlaceResult::already_exists()),
                ReplacementMode::ReplaceExisting => {}
            }
        }

        // The empty hash is satisfied without consulting disk state.
        if hash.is_empty_content() {
            if let Some(parent) = destination.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::File::create(destination)?;
            return Ok(PlaceResult {
                code: PlaceCode::PlacedWithCopy,
                size: 0,
                last_access_ticks: self.clock.now_ticks(),
            });
        }

        let guard = tokio::select! {
            _ = cancel.cancelled() => return Err(StoreError::Cancelled),
            guard = self.locks.acquire(hash) => guard,
        };

        let Some(info) = self.directory.touch(hash).await else {
            return Ok(PlaceResult::not_found());
        };

        if let Some(context) = pin {
            self.pins.pin(hash, info.total_size(), context);
        }

        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let want_link = self.use_hard_links
            && matches!(
                realization,
                PlaceRealization::HardLink | PlaceRealization::Any
            );

        if want_link {
            let linkable = access == AccessMode::ReadOnly
                && fsio::same_volume(&self.layout.primary(hash), destination)?;

            if linkable {
                match self
                    .place_by_link(hash, info, destination, replacement, cancel)
                    .await?
                {
                    LinkAttempt::Placed(result) => {
                        // The link is in place; a cancel that landed while
                        // realizing is reported from this consistent point.
                        cancel.err_if_cancelled()?;
                        return Ok(result);
                    }
                    LinkAttempt::ContentGone(outcome) => {
                        drop(guard);
                        self.eviction.announce(hash, &outcome).await;
                        cancel.err_if_cancelled()?;
                        return Ok(PlaceResult::not_found());
                    }
                    LinkAttempt::FallBackToCopy => {}
                }
            } else if realization == PlaceRealization::HardLink {
                // The strict mode cannot be satisfied here.
                return Err(if access == AccessMode::Write {
                    StoreError::HardLinkUnsupported
                } else {
                    StoreError::DifferentVolume
                });
            }
        }

        // Copy realization.
        let verify = realization == PlaceRealization::CopyWithVerify;
        let primary = self.layout.primary(hash);

        if verify {
            let (computed, _) = fsio::copy_and_hash(&primary, destination, hash.algorithm())?;
            if computed != *hash {
                // The stored bytes are corrupt. Scorch the local copy so a
                // peer fetch can repopulate it, and tell the caller the
                // content is gone.
                warn!(hash = %hash, actual = %computed, "Corrupt blob detected during placement");
                let _ = fsio::remove_blob(destination);
                let outcome = self
                    .eviction
                    .evict_locked(
                        hash,
                        EvictOptions {
                            force: true,
                            only_unlinked: false,
                        },
                    )
                    .await?;
                drop(guard);
                self.eviction.announce(hash, &outcome).await;
                cancel.err_if_cancelled()?;
                return Ok(PlaceResult::not_found());
            }
        } else {
            fsio::copy_file(&primary, destination)?;
        }

        self.finish_destination(destination, access);

        // The copy is complete and the touch/pin stand; report a cancel
        // that landed after mutation began.
        cancel.err_if_cancelled()?;
        Ok(PlaceResult {
            code: PlaceCode::PlacedWithCopy,
            size: info.file_size,
            last_access_ticks: info.last_access_ticks,
        })
    }

    /// Clears the replica cursor for a hash. Eviction paths call this so a
    /// stale cursor never outlives the replicas it pointed at.
    pub(crate) fn clear_cursor(&self, hash: &ContentHash) {
        self.cursors.lock().unwrap().remove(&hash.short());
    }

    async fn place_by_link(
        &self,
        hash: &ContentHash,
        info: ContentFileInfo,
        destination: &Path,
        replacement: ReplacementMode,
        cancel: &CancellationToken,
    ) -> Result<LinkAttempt> {
        let replica_count = info.replica_count.max(1);

        // Try the cursor's replica first, then the rest starting from a
        // random offset so concurrent placers spread out.
        let cursor = self
            .cursors
            .lock()
            .unwrap()
            .get(&hash.short())
            .copied()
            .filter(|n| *n < replica_count);
        let mut order: Vec<u32> = Vec::with_capacity(replica_count as usize);
        if let Some(n) = cursor {
            order.push(n);
        }
        let offset = rand::rng().random_range(0..replica_count);
        for i in 0..replica_count {
            let n = (offset + i) % replica_count;
            if Some(n) != cursor {
                order.push(n);
            }
        }

        for n in order {
            // Each candidate may heal or expand replicas; observe
            // cancellation between them, never mid-step.
            cancel.err_if_cancelled()?;

            let replica = self.layout.replica(hash, n);

            if self.at_link_budget(&replica) {
                self.clear_cursor(hash);
                continue;
            }

            match self.link_once(&replica, destination, replacement) {
                Ok(()) => {
                    self.cursors.lock().unwrap().insert(hash.short(), n);
                    return Ok(LinkAttempt::Placed(PlaceResult {
                        code: PlaceCode::PlacedWithHardLink,
                        size: info.file_size,
                        last_access_ticks: info.last_access_ticks,
                    }));
                }
                Err(LinkError::MaxLinkLimit) => {
                    self.learn_link_limit(&replica);
                    self.clear_cursor(hash);
                    continue;
                }
                Err(LinkError::SourceMissing) => {
                    match self.heal_missing_replica(hash, n).await? {
                        Healed::Recopied => {
                            // Healed; one retry on the same replica.
                            if self.link_once(&replica, destination, replacement).is_ok() {
                                self.cursors.lock().unwrap().insert(hash.short(), n);
                                return Ok(LinkAttempt::Placed(PlaceResult {
                                    code: PlaceCode::PlacedWithHardLink,
                                    size: info.file_size,
                                    last_access_ticks: info.last_access_ticks,
                                }));
                            }
                        }
                        Healed::PrimaryGone(outcome) => {
                            return Ok(LinkAttempt::ContentGone(outcome))
                        }
                    }
                }
                Err(LinkError::DestinationExists) => {
                    return Ok(LinkAttempt::Placed(PlaceResult::already_exists()));
                }
                Err(LinkError::DifferentVolume) | Err(LinkError::NotSupported) => {
                    return Ok(LinkAttempt::FallBackToCopy);
                }
                Err(LinkError::AccessDenied) => {
                    return Err(StoreError::AccessDenied(destination.to_path_buf()));
                }
                Err(LinkError::Other(e)) => return Err(StoreError::Io(e)),
            }
        }

        // Every replica is at the link limit; mint a new one and link it.
        let (replica, n) = self.ingest.expand_replicas(hash, cancel).await?;
        self.link_once(&replica, destination, replacement)
            .map_err(|e| match e {
                LinkError::Other(io) => StoreError::Io(io),
                other => StoreError::Io(std::io::Error::other(other.to_string())),
            })?;
        self.cursors.lock().unwrap().insert(hash.short(), n);

        Ok(LinkAttempt::Placed(PlaceResult {
            code: PlaceCode::PlacedWithHardLink,
            size: info.file_size,
            last_access_ticks: info.last_access_ticks,
        }))
    }

    fn link_once(
        &self,
        replica: &Path,
        destination: &Path,
        replacement: ReplacementMode,
    ) -> std::result::Result<(), LinkError> {
        if replacement == ReplacementMode::ReplaceExisting && destination.exists() {
            let _ = fsio::remove_blob(destination);
        }
        fsio::hard_link(replica, destination)
    }

    /// A replica vanished under us. Recopy it from the primary when the
    /// primary survives; when the primary itself is gone the content is
    /// unrecoverable locally and the entry is dropped.
    async fn heal_missing_replica(&self, hash: &ContentHash, index: u32) -> Result<Healed> {
        let primary = self.layout.primary(hash);

        if !primary.exists() {
            warn!(hash = %hash, "Primary missing on disk; dropping directory entry");
            let outcome = self
                .eviction
                .evict_locked(
                    hash,
                    EvictOptions {
                        force: true,
                        only_unlinked: false,
                    },
                )
                .await?;
            debug!(hash = %hash, files = outcome.evicted_files, "Stray replicas cleaned");
            self.clear_cursor(hash);
            return Ok(Healed::PrimaryGone(outcome));
        }

        if index == 0 {
            // The primary both exists and is missing? A racing repair; let
            // the caller retry against it.
            return Ok(Healed::Recopied);
        }

        warn!(hash = %hash, replica = index, "Recopying missing replica from primary");
        let staged = self.layout.temp_file();
        fsio::copy_file(&primary, &staged)?;
        if self.apply_deny_writes {
            let _ = fsio::set_deny_writes(&staged, true);
        }
        std::fs::rename(&staged, self.layout.replica(hash, index))?;
        Ok(Healed::Recopied)
    }

    /// Whether a replica's inode has no room for another link under the
    /// configured or learned budget.
    fn at_link_budget(&self, replica: &Path) -> bool {
        let limit = self.link_limit.load(Ordering::Relaxed);
        if limit == 0 {
            return false;
        }
        fsio::link_count(replica).map(|n| n >= limit).unwrap_or(false)
    }

    fn learn_link_limit(&self, replica: &Path) {
        if self.link_limit.load(Ordering::Relaxed) != 0 {
            return;
        }
        if let Ok(observed) = fsio::link_count(replica) {
            debug!(limit = observed, "Learned hardlink limit from EMLINK");
            self.link_limit.store(observed, Ordering::Relaxed);
        }
    }

    fn finish_destination(&self, destination: &Path, access: AccessMode) {
        let deny = access == AccessMode::ReadOnly && self.apply_deny_writes;
        let _ = fsio::set_deny_writes(destination, deny);
    }
}

enum LinkAttempt {
    Placed(PlaceResult),
    ContentGone(crate::evict::EvictOutcome),
    FallBackToCopy,
}

enum Healed {
    Recopied,
    PrimaryGone(crate::evict::EvictOutcome),
}
