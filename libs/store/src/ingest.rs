//! Ingest: bringing content into the store.
//!
//! Every put resolves to the same internal sequence: dedup-check against
//! the directory, reserve quota, realize the bytes at the primary path,
//! commit, record, pin. What varies is how the bytes are realized (move,
//! hardlink, copy) and where hash verification happens (before the lock
//! for move/link sources, during the copy for copy sources, nowhere for
//! trusted puts).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

use hoard_hash::{hash_file, ContentHash, HashAlgorithm};

use crate::announce::ChangeAnnouncer;
use crate::cancel::CancellationToken;
use crate::clock::Clock;
use crate::directory::{ContentDirectory, ContentFileInfo};
use crate::error::{Result, StoreError};
use crate::fsio::{self, LinkError};
use crate::layout::BlobLayout;
use crate::locks::{HashGuard, HashLockSet};
use crate::pin::{PinContext, PinRegistry};
use crate::quota::QuotaKeeper;

/// Chunk size for streaming puts.
const STREAM_CHUNK: usize = 64 * 1024;

/// How content is materialized at the primary path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealizationMode {
    /// Copy the source, verifying the hash while streaming.
    Copy,
    /// Rename the source into the store. Same-volume only.
    Move,
    /// Hardlink the source into the store.
    HardLink,
    /// Hardlink when possible, copy otherwise.
    Any,
    /// Copy without hash verification. The caller vouches for the bytes.
    CopyNoVerify,
}

/// Result of a put operation.
#[derive(Debug, Clone)]
pub struct PutResult {
    pub hash: ContentHash,
    pub size: u64,
    /// The content was already cached; no bytes moved.
    pub already_existed: bool,
    /// Time spent waiting on the hash lock.
    pub lock_wait: Duration,
}

/// How `put_internal` should realize the bytes.
enum Realize<'a> {
    /// A verified temp file ready to rename into place.
    Staged(PathBuf),
    /// Rename the source in.
    MoveFrom(&'a Path),
    /// Hardlink the source in; `fallback_copy` on unsupported filesystems.
    LinkFrom { source: &'a Path, fallback_copy: bool },
    /// Copy the source in, verifying against the target hash unless told
    /// not to.
    CopyFrom { source: &'a Path, verify: bool },
}

/// Ingest engine: put-file, put-stream, put-trusted, replica expansion.
pub struct IngestEngine {
    layout: Arc<BlobLayout>,
    directory: Arc<ContentDirectory>,
    locks: Arc<HashLockSet>,
    quota: Arc<QuotaKeeper>,
    pins: Arc<PinRegistry>,
    announcer: Arc<dyn ChangeAnnouncer>,
    clock: Arc<dyn Clock>,
    use_hard_links: bool,
    apply_deny_writes: bool,
    pinned_fast_path: bool,
}

impl IngestEngine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        layout: Arc<BlobLayout>,
        directory: Arc<ContentDirectory>,
        locks: Arc<HashLockSet>,
        quota: Arc<QuotaKeeper>,
        pins: Arc<PinRegistry>,
        announcer: Arc<dyn ChangeAnnouncer>,
        clock: Arc<dyn Clock>,
        use_hard_links: bool,
        apply_deny_writes: bool,
        pinned_fast_path: bool,
    ) -> Self {
        Self {
            layout,
            directory,
            locks,
            quota,
            pins,
            announcer,
            clock,
            use_hard_links,
            apply_deny_writes,
            pinned_fast_path,
        }
    }

    /// Ingests a file from disk.
    ///
    /// `expected` pins down the content identity up front; without it the
    /// source is hashed with `algorithm`. A supplied hash that turns out
    /// not to match the bytes rolls everything back and surfaces
    /// [`StoreError::HashMismatch`], except under
    /// [`RealizationMode::CopyNoVerify`].
    pub async fn put_file(
        &self,
        source: &Path,
        mode: RealizationMode,
        algorithm: HashAlgorithm,
        expected: Option<ContentHash>,
        pin: Option<&PinContext>,
        cancel: &CancellationToken,
    ) -> Result<PutResult> {
        cancel.err_if_cancelled()?;

        let algorithm = expected.map(|h| h.algorithm()).unwrap_or(algorithm);
        let metadata = std::fs::metadata(source)
            .map_err(|_| StoreError::SourceNotFound(source.to_path_buf()))?;
        if !metadata.is_file() {
            return Err(StoreError::SourceNotFound(source.to_path_buf()));
        }
        let size = metadata.len();

        if size == 0 {
            let empty = algorithm.empty_hash();
            if let Some(expected) = expected {
                if expected != empty {
                    return Err(StoreError::HashMismatch {
                        expected,
                        actual: empty,
                    });
                }
            }
            return Ok(empty_result(empty));
        }

        // Fast path: content already pinned through this caller's context
        // cannot be evicted, so a directory hit is authoritative without
        // the lock.
        if self.pinned_fast_path {
            if let (Some(expected), Some(context)) = (expected, pin) {
                if context.holds(&expected) && self.directory.touch(&expected).await.is_some() {
                    debug!(hash = %expected, "Put served by pinned fast path");
                    return Ok(PutResult {
                        hash: expected,
                        size,
                        already_existed: true,
                        lock_wait: Duration::ZERO,
                    });
                }
            }
        }

        let try_link = self.use_hard_links
            && matches!(mode, RealizationMode::HardLink | RealizationMode::Any);

        let (hash, realize) = if matches!(mode, RealizationMode::Move) || try_link {
            // The bytes will be adopted in place, so identity must be
            // settled before they move.
            let (computed, _) = hash_file(algorithm, source)?;
            if let Some(expected) = expected {
                if computed != expected {
                    return Err(StoreError::HashMismatch {
                        expected,
                        actual: computed,
                    });
                }
            }
            let hash = computed;

            let realize = if matches!(mode, RealizationMode::Move) {
                Realize::MoveFrom(source)
            } else {
                Realize::LinkFrom {
                    source,
                    fallback_copy: matches!(mode, RealizationMode::Any),
                }
            };
            (hash, realize)
        } else if let Some(expected) = expected {
            (
                expected,
                Realize::CopyFrom {
                    source,
                    verify: !matches!(mode, RealizationMode::CopyNoVerify),
                },
            )
        } else {
            // Unknown hash and a copying mode: stage and hash in one pass
            // before taking any lock.
            let staged = self.layout.temp_file();
            let (computed, staged_size) = fsio::copy_and_hash(source, &staged, algorithm)?;
            debug_assert_eq!(staged_size, size);
            (computed, Realize::Staged(staged))
        };

        let guard = self.lock_cancellable(&hash, &realize, cancel).await?;
        let outcome = self.put_internal(guard, hash, size, realize, pin, cancel).await?;
        self.finish(outcome).await
    }

    /// Ingests content from a stream, hashing while writing.
    pub async fn put_stream<R>(
        &self,
        mut reader: R,
        algorithm: HashAlgorithm,
        pin: Option<&PinContext>,
        cancel: &CancellationToken,
    ) -> Result<PutResult>
    where
        R: AsyncRead + Unpin,
    {
        cancel.err_if_cancelled()?;

        let staged = self.layout.temp_file();
        let mut file = std::fs::File::create(&staged)?;
        let mut hasher = algorithm.hasher();
        let mut buf = vec![0u8; STREAM_CHUNK];
        let mut size = 0u64;

        loop {
            if cancel.is_cancelled() {
                drop(file);
                let _ = fsio::remove_blob(&staged);
                return Err(StoreError::Cancelled);
            }
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            std::io::Write::write_all(&mut file, &buf[..n])?;
            size += n as u64;
        }
        file.sync_all()?;
        drop(file);

        let hash = hasher.finalize();
        if size == 0 {
            let _ = fsio::remove_blob(&staged);
            return Ok(empty_result(hash));
        }

        let realize = Realize::Staged(staged);
        let guard = self.lock_cancellable(&hash, &realize, cancel).await?;
        let outcome = self.put_internal(guard, hash, size, realize, pin, cancel).await?;
        self.finish(outcome).await
    }

    /// Ingests a file whose hash the caller vouches for. The declared size
    /// is still checked against the file.
    pub async fn put_trusted_file(
        &self,
        source: &Path,
        hash: ContentHash,
        size: u64,
        mode: RealizationMode,
        pin: Option<&PinContext>,
        cancel: &CancellationToken,
    ) -> Result<PutResult> {
        cancel.err_if_cancelled()?;

        let metadata = std::fs::metadata(source)
            .map_err(|_| StoreError::SourceNotFound(source.to_path_buf()))?;
        if metadata.len() != size {
            return Err(StoreError::SizeMismatch {
                expected: size,
                actual: metadata.len(),
            });
        }

        if size == 0 && hash.is_empty_content() {
            return Ok(empty_result(hash));
        }

        let try_link = self.use_hard_links
            && matches!(mode, RealizationMode::HardLink | RealizationMode::Any);
        let realize = if matches!(mode, RealizationMode::Move) {
            Realize::MoveFrom(source)
        } else if try_link {
            Realize::LinkFrom {
                source,
                fallback_copy: matches!(mode, RealizationMode::Any),
            }
        } else {
            Realize::CopyFrom {
                source,
                verify: false,
            }
        };

        let guard = self.lock_cancellable(&hash, &realize, cancel).await?;
        let outcome = self.put_internal(guard, hash, size, realize, pin, cancel).await?;
        self.finish(outcome).await
    }

    /// Copies the primary to the next replica slot and records it.
    ///
    /// Invoked by placement when every existing replica is at the OS
    /// hardlink limit. The caller holds the hash lock. Returns the new
    /// replica's path and index.
    pub(crate) async fn expand_replicas(
        &self,
        hash: &ContentHash,
        cancel: &CancellationToken,
    ) -> Result<(PathBuf, u32)> {
        let info = self
            .directory
            .get(hash)
            .await
            .ok_or(StoreError::ContentNotFound(*hash))?;

        let reservation = self.quota.reserve(info.file_size, false, cancel).await?;

        let primary = self.layout.primary(hash);
        let staged = self.layout.temp_file();
        fsio::copy_file(&primary, &staged)?;
        if self.apply_deny_writes {
            let _ = fsio::set_deny_writes(&staged, true);
        }

        let index = info.replica_count;
        let replica = self.layout.replica(hash, index);
        std::fs::rename(&staged, &replica)?;

        reservation.commit();
        self.directory
            .update(hash, false, |current| {
                current.map(|mut info| {
                    info.replica_count += 1;
                    info
                })
            })
            .await;

        info!(hash = %hash, replica = index, "Expanded replicas at hardlink limit");
        Ok((replica, index))
    }

    /// Acquires the hash lock, honoring cancellation and cleaning up any
    /// staged file if the operation is abandoned.
    async fn lock_cancellable(
        &self,
        hash: &ContentHash,
        realize: &Realize<'_>,
        cancel: &CancellationToken,
    ) -> Result<HashGuard> {
        tokio::select! {
            _ = cancel.cancelled() => {
                if let Realize::Staged(staged) = realize {
                    let _ = fsio::remove_blob(staged);
                }
                Err(StoreError::Cancelled)
            }
            guard = self.locks.acquire(hash) => Ok(guard),
        }
    }

    /// The single put path, run under the hash lock.
    async fn put_internal(
        &self,
        guard: HashGuard,
        hash: ContentHash,
        size: u64,
        realize: Realize<'_>,
        pin: Option<&PinContext>,
        cancel: &CancellationToken,
    ) -> Result<PutOutcome> {
        let lock_wait = guard.waited();

        // Already cached? The primary must actually be on disk; a directory
        // entry without its file is repaired by falling through to a fresh
        // ingest.
        if let Some(info) = self.directory.get(&hash).await {
            if self.layout.primary(&hash).exists() {
                discard_staged(&realize);
                self.directory.touch(&hash).await;
                if let Some(context) = pin {
                    self.pins.pin(&hash, info.total_size(), context);
                }
                // The touch and pin stand either way; a cancel that landed
                // during them is reported now.
                cancel.err_if_cancelled()?;
                return Ok(PutOutcome {
                    result: PutResult {
                        hash,
                        size: info.file_size,
                        already_existed: true,
                        lock_wait,
                    },
                    announce: None,
                    _guard: guard,
                });
            }

            warn!(hash = %hash, "Directory entry had no primary on disk; re-ingesting");
            self.directory.update(&hash, false, |_| None).await;
        }

        // Nothing mutated yet; cancellation can still abandon cleanly.
        if cancel.is_cancelled() {
            discard_staged(&realize);
            return Err(StoreError::Cancelled);
        }

        let reservation = match self.quota.reserve(size, false, cancel).await {
            Ok(reservation) => reservation,
            Err(e) => {
                discard_staged(&realize);
                return Err(e);
            }
        };

        let primary = self.layout.primary(&hash);
        std::fs::create_dir_all(self.layout.blob_dir(&hash))?;

        match realize {
            Realize::Staged(staged) => {
                if self.apply_deny_writes {
                    let _ = fsio::set_deny_writes(&staged, true);
                }
                std::fs::rename(&staged, &primary)?;
            }
            Realize::MoveFrom(source) => {
                std::fs::rename(source, &primary).map_err(|e| {
                    if e.raw_os_error() == Some(libc::EXDEV) {
                        StoreError::DifferentVolume
                    } else {
                        StoreError::Io(e)
                    }
                })?;
                if self.apply_deny_writes {
                    let _ = fsio::set_deny_writes(&primary, true);
                }
            }
            Realize::LinkFrom {
                source,
                fallback_copy,
            } => {
                self.link_or_copy_in(source, &primary, &hash, fallback_copy)?;
            }
            Realize::CopyFrom { source, verify } => {
                let staged = self.layout.temp_file();
                if verify {
                    let (computed, _) =
                        fsio::copy_and_hash(source, &staged, hash.algorithm())?;
                    if computed != hash {
                        let _ = fsio::remove_blob(&staged);
                        return Err(StoreError::HashMismatch {
                            expected: hash,
                            actual: computed,
                        });
                    }
                } else {
                    fsio::copy_file(source, &staged)?;
                }
                if self.apply_deny_writes {
                    let _ = fsio::set_deny_writes(&staged, true);
                }
                std::fs::rename(&staged, &primary)?;
            }
        }

        reservation.commit();

        let now = self.clock.now_ticks();
        self.directory
            .update(&hash, false, |_| {
                Some(ContentFileInfo {
                    file_size: size,
                    last_access_ticks: now,
                    replica_count: 1,
                })
            })
            .await;

        if let Some(context) = pin {
            self.pins.pin(&hash, size, context);
        }

        // A cancel that arrived after mutation began is honored only here,
        // at the consistent point: the content stays committed, the caller
        // gets the cancellation.
        cancel.err_if_cancelled()?;

        debug!(hash = %hash, size, "Content ingested");
        Ok(PutOutcome {
            result: PutResult {
                hash,
                size,
                already_existed: false,
                lock_wait,
            },
            announce: Some((hash, size)),
            _guard: guard,
        })
    }

    fn link_or_copy_in(
        &self,
        source: &Path,
        primary: &Path,
        hash: &ContentHash,
        fallback_copy: bool,
    ) -> Result<()> {
        let fall_back = |this: &Self| -> Result<()> {
            let staged = this.layout.temp_file();
            fsio::copy_file(source, &staged)?;
            if this.apply_deny_writes {
                let _ = fsio::set_deny_writes(&staged, true);
            }
            std::fs::rename(&staged, primary)?;
            Ok(())
        };

        match fsio::hard_link(source, primary) {
            Ok(()) => {
                if self.apply_deny_writes {
                    let _ = fsio::set_deny_writes(primary, true);
                }
                Ok(())
            }
            Err(LinkError::DestinationExists) => {
                // Leftover file from an interrupted ingest; the directory
                // had no entry, so it is ours to replace.
                fsio::remove_blob(primary)?;
                fsio::hard_link(source, primary).map_err(|e| link_error_to_store(e, primary))?;
                if self.apply_deny_writes {
                    let _ = fsio::set_deny_writes(primary, true);
                }
                Ok(())
            }
            Err(LinkError::DifferentVolume) if fallback_copy => fall_back(self),
            Err(LinkError::NotSupported) if fallback_copy => fall_back(self),
            Err(LinkError::MaxLinkLimit) if fallback_copy => fall_back(self),
            Err(LinkError::DifferentVolume) => Err(StoreError::DifferentVolume),
            Err(LinkError::NotSupported) => Err(StoreError::HardLinkUnsupported),
            Err(e) => {
                debug!(hash = %hash, error = %e, "Hardlink ingest failed");
                Err(link_error_to_store(e, primary))
            }
        }
    }

    /// Drops the hash lock, then announces outside it.
    async fn finish(&self, outcome: PutOutcome) -> Result<PutResult> {
        let PutOutcome {
            result,
            announce,
            _guard,
        } = outcome;
        drop(_guard);

        if let Some((hash, size)) = announce {
            self.announcer.content_added(hash, size).await;
        }
        Ok(result)
    }
}

struct PutOutcome {
    result: PutResult,
    announce: Option<(ContentHash, u64)>,
    _guard: HashGuard,
}

fn empty_result(hash: ContentHash) -> PutResult {
    PutResult {
        hash,
        size: 0,
        already_existed: true,
        lock_wait: Duration::ZERO,
    }
}

fn discard_staged(realize: &Realize<'_>) {
    if let Realize::Staged(staged) = realize {
        let _ = fsio::remove_blob(staged);
    }
}

fn link_error_to_store(e: LinkError, path: &Path) -> StoreError {
    match e {
        LinkError::SourceMissing => StoreError::SourceNotFound(path.to_path_buf()),
        LinkError::DestinationExists => StoreError::DestinationExists(path.to_path_buf()),
        LinkError::DifferentVolume => StoreError::DifferentVolume,
        LinkError::NotSupported => StoreError::HardLinkUnsupported,
        LinkError::AccessDenied => StoreError::AccessDenied(path.to_path_buf()),
        LinkError::MaxLinkLimit => {
            StoreError::Io(std::io::Error::other("hardlink limit reached"))
        }
        LinkError::Other(e) => StoreError::Io(e),
    }
}
