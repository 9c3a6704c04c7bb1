//! The content store facade.
//!
//! Composes the directory, lock set, quota keeper, pin registry, and the
//! ingest/placement/eviction/self-check engines behind one handle, and
//! owns the lifecycle: startup (load or reconstruct state, clean staging,
//! start the purge loop) and shutdown (drain, persist, clean up).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use hoard_hash::{ContentHash, HashAlgorithm};

use crate::announce::{ChangeAnnouncer, LocationStore, NullAnnouncer};
use crate::cancel::{CancellationSource, CancellationToken};
use crate::check::{SelfCheckReport, SelfChecker};
use crate::clock::{Clock, SystemClock};
use crate::config::StoreConfig;
use crate::directory::{ContentDirectory, ContentFileInfo};
use crate::error::{Result, StoreError};
use crate::evict::{EvictOptions, EvictOutcome, EvictionEngine};
use crate::fsio;
use crate::ingest::{IngestEngine, PutResult, RealizationMode};
use crate::layout::BlobLayout;
use crate::locks::HashLockSet;
use crate::pin::{PinContext, PinRegistry, PinSizeHistory};
use crate::place::{AccessMode, PlaceRealization, PlaceResult, PlacementEngine, ReplacementMode};
use crate::quota::QuotaKeeper;

/// File under the root holding the serialized content directory.
const DIRECTORY_FILE: &str = "content.dir";

/// File under the root holding the pin-size history ring.
const PIN_HISTORY_FILE: &str = "pins.ring";

/// Point-in-time store counters.
#[derive(Debug, Clone, Copy)]
pub struct StoreStats {
    /// Distinct hashes in the directory.
    pub content_count: usize,
    /// Committed bytes across all replicas.
    pub total_bytes: u64,
    /// Reserved, not yet committed bytes.
    pub reserved_bytes: u64,
    /// Bytes currently shielded by pins.
    pub pinned_bytes: u64,
    /// Replica files removed since startup.
    pub evicted_files: u64,
    /// Content mismatches found by self-checks since startup.
    pub self_check_mismatches: u64,
    /// Cumulative hash-lock wait time.
    pub lock_wait: Duration,
}

/// A local content-addressed store.
pub struct ContentStore {
    config: StoreConfig,
    layout: Arc<BlobLayout>,
    directory: Arc<ContentDirectory>,
    locks: Arc<HashLockSet>,
    quota: Arc<QuotaKeeper>,
    pins: Arc<PinRegistry>,
    ingest: Arc<IngestEngine>,
    placement: Arc<PlacementEngine>,
    eviction: Arc<EvictionEngine>,
    checker: Arc<SelfChecker>,
    shutdown: CancellationSource,
    /// Serializes purge passes; `sync` waits on it to observe quiescence.
    purge_gate: Arc<tokio::sync::Mutex<()>>,
    purge_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ContentStore {
    /// Opens a store with default collaborators: no announcements, no
    /// distributed location hook, wall-clock time.
    pub async fn open(config: StoreConfig) -> Result<Self> {
        Self::open_with(config, Arc::new(NullAnnouncer), None, Arc::new(SystemClock)).await
    }

    /// Opens a store with explicit collaborators.
    pub async fn open_with(
        config: StoreConfig,
        announcer: Arc<dyn ChangeAnnouncer>,
        location: Option<Arc<dyn LocationStore>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let layout = Arc::new(BlobLayout::new(&config.root));
        std::fs::create_dir_all(layout.shared_dir())?;
        fsio::clean_dir(&layout.temp_dir())?;

        let directory = Arc::new(ContentDirectory::new(clock.clone()));
        let directory_path = config.root.join(DIRECTORY_FILE);
        match directory.load(&directory_path).await {
            Ok(entries) => {
                info!(entries, "Content directory loaded from snapshot");
            }
            Err(e) => {
                if directory_path.exists() {
                    warn!(error = %e, "Directory snapshot unusable; reconstructing from disk");
                }
                let blobs = layout.scan_blobs()?;
                directory.reconstruct(&blobs).await;
            }
        }

        let history_path = config
            .pin_history_path
            .clone()
            .unwrap_or_else(|| config.root.join(PIN_HISTORY_FILE));
        let history = PinSizeHistory::load(&history_path, config.history_window_size)?;
        let pins = Arc::new(PinRegistry::new(history));

        let quota = Arc::new(QuotaKeeper::new(
            config.hard_cap_bytes,
            config.soft_cap_bytes,
            config.max_quota_wait(),
        ));
        quota.calibrate(directory.total_size().await);

        let locks = Arc::new(HashLockSet::new());

        let ingest = Arc::new(IngestEngine::new(
            layout.clone(),
            directory.clone(),
            locks.clone(),
            quota.clone(),
            pins.clone(),
            announcer.clone(),
            clock.clone(),
            config.use_hard_links,
            config.apply_deny_writes,
            config.pinned_fast_path,
        ));

        let eviction = Arc::new(EvictionEngine::new(
            layout.clone(),
            directory.clone(),
            locks.clone(),
            pins.clone(),
            quota.clone(),
            announcer.clone(),
            location,
        ));

        let placement = Arc::new(PlacementEngine::new(
            layout.clone(),
            directory.clone(),
            locks.clone(),
            pins.clone(),
            ingest.clone(),
            eviction.clone(),
            clock.clone(),
            config.hard_link_limit,
            config.use_hard_links,
            config.apply_deny_writes,
        ));

        let checker = Arc::new(SelfChecker::new(
            layout.clone(),
            directory.clone(),
            locks.clone(),
            quota.clone(),
            clock.clone(),
        ));

        let shutdown = CancellationSource::new();
        let purge_gate = Arc::new(tokio::sync::Mutex::new(()));
        let purge_task = tokio::spawn(run_purge_loop(
            quota.clone(),
            eviction.clone(),
            purge_gate.clone(),
            shutdown.token(),
            config.purge_interval(),
        ));

        let store = Self {
            config,
            layout,
            directory,
            locks,
            quota,
            pins,
            ingest,
            placement,
            eviction,
            checker,
            shutdown,
            purge_gate,
            purge_task: std::sync::Mutex::new(Some(purge_task)),
        };

        if store.config.self_check_on_startup {
            store.checker.run(&store.shutdown.token()).await?;
        }

        info!(
            root = %store.config.root.display(),
            entries = store.directory.count().await,
            bytes = store.quota.current_bytes(),
            "Content store opened"
        );
        Ok(store)
    }

    /// Stops background work, persists state, and cleans staging.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();

        let task = self.purge_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        self.directory
            .save(&self.config.root.join(DIRECTORY_FILE))
            .await?;
        self.pins.save_history(&self.history_path())?;
        fsio::clean_dir(&self.layout.temp_dir())?;

        info!(root = %self.config.root.display(), "Content store shut down");
        Ok(())
    }

    // =========================================================================
    // Ingest
    // =========================================================================

    /// Ingests a file. See [`IngestEngine::put_file`].
    pub async fn put_file(
        &self,
        source: &Path,
        mode: RealizationMode,
        algorithm: HashAlgorithm,
        expected: Option<ContentHash>,
        pin: Option<&PinContext>,
        cancel: &CancellationToken,
    ) -> Result<PutResult> {
        let token = self.op_token(cancel);
        self.ingest
            .put_file(source, mode, algorithm, expected, pin, &token)
            .await
    }

    /// Ingests content from a stream.
    pub async fn put_stream<R>(
        &self,
        reader: R,
        algorithm: HashAlgorithm,
        pin: Option<&PinContext>,
        cancel: &CancellationToken,
    ) -> Result<PutResult>
    where
        R: AsyncRead + Unpin,
    {
        let token = self.op_token(cancel);
        self.ingest.put_stream(reader, algorithm, pin, &token).await
    }

    /// Ingests a file whose hash and size the caller vouches for.
    pub async fn put_trusted_file(
        &self,
        source: &Path,
        hash: ContentHash,
        size: u64,
        mode: RealizationMode,
        pin: Option<&PinContext>,
        cancel: &CancellationToken,
    ) -> Result<PutResult> {
        let token = self.op_token(cancel);
        self.ingest
            .put_trusted_file(source, hash, size, mode, pin, &token)
            .await
    }

    // =========================================================================
    // Placement and retrieval
    // =========================================================================

    /// Places stored content at a destination path.
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
        let token = self.op_token(cancel);
        self.placement
            .place_file(hash, destination, access, replacement, realization, pin, &token)
            .await
    }

    /// Whether the store holds a hash. Touches the entry; optionally pins.
    pub async fn contains(&self, hash: &ContentHash, pin: Option<&PinContext>) -> bool {
        if hash.is_empty_content() {
            return true;
        }

        match pin {
            None => self.directory.touch(hash).await.is_some(),
            Some(context) => {
                let Some(_guard) = self.acquire_for_pin(hash).await else {
                    return false;
                };
                match self.directory.touch(hash).await {
                    Some(info) => {
                        self.pins.pin(hash, info.total_size(), context);
                        true
                    }
                    None => false,
                }
            }
        }
    }

    /// Opens the stored bytes for reading. Empty content is served from
    /// memory; a missing hash yields `None`.
    pub async fn open_stream(
        &self,
        hash: &ContentHash,
        pin: Option<&PinContext>,
    ) -> Result<Option<Box<dyn AsyncRead + Send + Unpin>>> {
        if hash.is_empty_content() {
            return Ok(Some(Box::new(tokio::io::empty())));
        }

        let _guard = self.locks.acquire(hash).await;
        let Some(info) = self.directory.touch(hash).await else {
            return Ok(None);
        };

        match tokio::fs::File::open(self.layout.primary(hash)).await {
            Ok(file) => {
                if let Some(context) = pin {
                    self.pins.pin(hash, info.total_size(), context);
                }
                Ok(Some(Box::new(file)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(hash = %hash, "Primary vanished; dropping directory entry");
                self.directory.update(hash, false, |_| None).await;
                Ok(None)
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    /// Returns the content size and whether the hash was already pinned,
    /// then pins it through the given context.
    pub async fn content_size_and_pinned(
        &self,
        hash: &ContentHash,
        context: &PinContext,
    ) -> Option<(u64, bool)> {
        if hash.is_empty_content() {
            return Some((0, true));
        }

        let _guard = self.acquire_for_pin(hash).await?;
        let info = self.directory.touch(hash).await?;
        let was_pinned = self.pins.is_pinned(hash);
        self.pins.pin(hash, info.total_size(), context);
        Some((info.file_size, was_pinned))
    }

    /// Acquires a hash lock for a pin-taking lookup, bounded by the pin
    /// wait budget. `None` means the lock stayed contended past it.
    async fn acquire_for_pin(&self, hash: &ContentHash) -> Option<crate::locks::HashGuard> {
        tokio::time::timeout(self.config.max_pin_wait(), self.locks.acquire(hash))
            .await
            .ok()
    }

    // =========================================================================
    // Pinning
    // =========================================================================

    /// Creates a pin context.
    pub fn create_pin_context(&self) -> PinContext {
        self.pins.create_context()
    }

    /// Releases every pin the context holds and refreshes quota plans.
    pub async fn dispose_pin_context(&self, context: PinContext) {
        self.pins.dispose(context, &self.locks).await;
        self.quota.calibrate(self.directory.total_size().await);
    }

    /// Whether a hash is pinned by any context.
    pub fn is_pinned(&self, hash: &ContentHash) -> bool {
        self.pins.is_pinned(hash)
    }

    /// Asserts a pin invariant. Panics when broken; see
    /// [`PinRegistry::verify_pinned`].
    pub fn verify_pinned(&self, hash: &ContentHash, context: Option<&PinContext>) {
        self.pins.verify_pinned(hash, context);
    }

    // =========================================================================
    // Eviction
    // =========================================================================

    /// Evicts a hash.
    pub async fn evict(&self, hash: &ContentHash, options: EvictOptions) -> Result<EvictOutcome> {
        let outcome = self.eviction.evict(hash, options).await?;
        if outcome.evicted {
            self.placement.clear_cursor(hash);
        }
        Ok(outcome)
    }

    /// Removes a hash unconditionally.
    pub async fn delete(&self, hash: &ContentHash) -> Result<EvictOutcome> {
        let outcome = self.eviction.delete(hash).await?;
        self.placement.clear_cursor(hash);
        Ok(outcome)
    }

    /// Waits for in-flight background eviction. With `purge`, additionally
    /// drives the store down to the soft cap.
    pub async fn sync(&self, purge: bool) -> Result<()> {
        let _gate = self.purge_gate.lock().await;
        if purge {
            self.eviction
                .purge_to(self.quota.soft_cap(), false, &self.shutdown.token())
                .await?;
        }
        Ok(())
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Snapshot of all stored hashes.
    pub async fn enumerate_hashes(&self) -> Vec<ContentHash> {
        self.directory.snapshot_hashes().await
    }

    /// Snapshot of all stored hashes with their attributes.
    pub async fn enumerate_info(&self) -> Vec<(ContentHash, ContentFileInfo)> {
        self.directory.snapshot_info().await
    }

    /// Committed bytes.
    pub fn current_bytes(&self) -> u64 {
        self.quota.current_bytes()
    }

    /// Runs a self-check pass now.
    pub async fn self_check(&self) -> Result<SelfCheckReport> {
        self.checker.run(&self.shutdown.token()).await
    }

    /// Point-in-time counters.
    pub async fn stats(&self) -> StoreStats {
        StoreStats {
            content_count: self.directory.count().await,
            total_bytes: self.quota.current_bytes(),
            reserved_bytes: self.quota.reserved_bytes(),
            pinned_bytes: self.pins.pinned_bytes(),
            evicted_files: self.eviction.evicted_files_total(),
            self_check_mismatches: self.checker.mismatches_total(),
            lock_wait: self.locks.total_wait(),
        }
    }

    fn history_path(&self) -> PathBuf {
        self.config
            .pin_history_path
            .clone()
            .unwrap_or_else(|| self.config.root.join(PIN_HISTORY_FILE))
    }

    fn op_token(&self, cancel: &CancellationToken) -> CancellationToken {
        self.shutdown.token().merged(cancel)
    }
}

impl Drop for ContentStore {
    fn drop(&mut self) {
        // An un-shutdown store must not leave the purge loop running.
        if let Some(task) = self.purge_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

/// Background purge loop: wakes on a timer and on reservation pressure,
/// drives committed bytes down to the soft cap, exits on shutdown.
async fn run_purge_loop(
    quota: Arc<QuotaKeeper>,
    eviction: Arc<EvictionEngine>,
    gate: Arc<tokio::sync::Mutex<()>>,
    token: CancellationToken,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick is immediate; consume it so the loop starts idle.
    ticker.tick().await;

    info!(interval_ms = interval.as_millis() as u64, "Purge loop started");

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
            _ = quota.purge_wanted() => {}
        }

        let force = quota.take_force_request();
        if !force && !quota.needs_purge() {
            continue;
        }

        let _gate = gate.lock().await;
        if let Err(e) = eviction.purge_to(quota.soft_cap(), force, &token).await {
            warn!(error = %e, "Purge pass failed");
        }
    }

    info!("Purge loop stopped");
}
