//! Quota accounting and reservation back-pressure.
//!
//! The keeper tracks committed bytes plus in-flight reservations against a
//! hard cap. Reservations that do not fit suspend the caller, nudge the
//! purge loop, and retry as evictions free space, up to a wait budget.
//! Dropping the store below the soft cap is the purge loop's job; the
//! keeper only says when that is needed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::cancel::CancellationToken;
use crate::error::{Result, StoreError};

#[derive(Debug, Default)]
struct QuotaState {
    current_bytes: u64,
    reserved_bytes: u64,
}

/// Tracks total stored bytes and space reservations.
pub struct QuotaKeeper {
    state: Mutex<QuotaState>,
    hard_cap: u64,
    soft_cap: u64,
    max_wait: Duration,
    /// Woken whenever bytes are freed or released.
    freed: Notify,
    /// Woken when a reservation wants the purge loop to run.
    purge_wanted: Notify,
    /// A waiting reservation was tagged force: the next purge pass may
    /// reclaim pinned content.
    force_wanted: AtomicBool,
    /// Reservations that gave up waiting.
    rejected_total: AtomicU64,
}

impl QuotaKeeper {
    /// Creates a keeper with the given caps and reservation wait budget.
    pub fn new(hard_cap: u64, soft_cap: u64, max_wait: Duration) -> Self {
        Self {
            state: Mutex::new(QuotaState::default()),
            hard_cap,
            soft_cap,
            max_wait,
            freed: Notify::new(),
            purge_wanted: Notify::new(),
            force_wanted: AtomicBool::new(false),
            rejected_total: AtomicU64::new(0),
        }
    }

    /// Bytes committed to the directory.
    pub fn current_bytes(&self) -> u64 {
        self.state.lock().unwrap().current_bytes
    }

    /// Bytes reserved but not yet committed.
    pub fn reserved_bytes(&self) -> u64 {
        self.state.lock().unwrap().reserved_bytes
    }

    /// The hard cap.
    pub fn hard_cap(&self) -> u64 {
        self.hard_cap
    }

    /// The purge target.
    pub fn soft_cap(&self) -> u64 {
        self.soft_cap
    }

    /// Whether the committed total is above the soft cap.
    pub fn needs_purge(&self) -> bool {
        self.current_bytes() > self.soft_cap
    }

    /// Reserves space for incoming content.
    ///
    /// If the bytes do not fit under the hard cap the caller suspends while
    /// the purge loop evicts, retrying on every freed notification until
    /// the wait budget expires. A `force` reservation licenses the purge
    /// pass it triggers to reclaim pinned content.
    pub async fn reserve(
        self: &Arc<Self>,
        bytes: u64,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<Reservation> {
        // Nothing can ever free enough for this; fail without waiting.
        if bytes > self.hard_cap {
            self.rejected_total.fetch_add(1, Ordering::Relaxed);
            return Err(StoreError::QuotaExceeded {
                requested: bytes,
                hard_cap: self.hard_cap,
            });
        }

        let deadline = Instant::now() + self.max_wait;
        loop {
            // Created before the capacity check so a free racing with the
            // check still wakes us.
            let freed = self.freed.notified();

            {
                let mut state = self.state.lock().unwrap();
                if state.current_bytes + state.reserved_bytes + bytes <= self.hard_cap {
                    state.reserved_bytes += bytes;
                    return Ok(Reservation {
                        keeper: Arc::clone(self),
                        bytes,
                        settled: false,
                    });
                }
            }

            debug!(bytes, force, "Reservation over hard cap, waiting for eviction");
            if force {
                self.force_wanted.store(true, Ordering::SeqCst);
            }
            self.purge_wanted.notify_one();

            tokio::select! {
                _ = freed => {}
                _ = cancel.cancelled() => return Err(StoreError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    self.rejected_total.fetch_add(1, Ordering::Relaxed);
                    return Err(StoreError::QuotaExceeded {
                        requested: bytes,
                        hard_cap: self.hard_cap,
                    });
                }
            }
        }
    }

    /// Records that content bytes left the store.
    pub fn on_evicted(&self, bytes: u64) {
        {
            let mut state = self.state.lock().unwrap();
            state.current_bytes = state.current_bytes.saturating_sub(bytes);
        }
        self.freed.notify_waiters();
    }

    /// Replaces the committed total with a figure recomputed from the
    /// directory. Used after pin releases and self-check repairs, when
    /// eviction plans go stale.
    pub fn calibrate(&self, directory_total: u64) {
        {
            let mut state = self.state.lock().unwrap();
            state.current_bytes = directory_total;
        }
        self.freed.notify_waiters();
    }

    /// Resolves when a reservation has asked for a purge.
    pub async fn purge_wanted(&self) {
        self.purge_wanted.notified().await;
    }

    /// Consumes a pending force request, if any. The purge pass that picks
    /// it up may evict pinned content.
    pub fn take_force_request(&self) -> bool {
        self.force_wanted.swap(false, Ordering::SeqCst)
    }

    /// Count of reservations that failed with `QuotaExceeded`.
    pub fn rejected_total(&self) -> u64 {
        self.rejected_total.load(Ordering::Relaxed)
    }
}

/// An uncommitted quota charge.
///
/// Commit after the content lands in the directory; dropping without
/// committing releases the charge.
pub struct Reservation {
    keeper: Arc<QuotaKeeper>,
    bytes: u64,
    settled: bool,
}

impl Reservation {
    /// The reserved byte count.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Converts the reservation into committed bytes.
    pub fn commit(mut self) {
        let mut state = self.keeper.state.lock().unwrap();
        state.reserved_bytes = state.reserved_bytes.saturating_sub(self.bytes);
        state.current_bytes += self.bytes;
        self.settled = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        {
            let mut state = self.keeper.state.lock().unwrap();
            state.reserved_bytes = state.reserved_bytes.saturating_sub(self.bytes);
        }
        self.keeper.freed.notify_waiters();
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("bytes", &self.bytes)
            .field("settled", &self.settled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keeper(hard: u64, soft: u64) -> Arc<QuotaKeeper> {
        Arc::new(QuotaKeeper::new(hard, soft, Duration::from_millis(50)))
    }

    #[tokio::test]
    async fn test_reserve_commit() {
        let keeper = keeper(100, 80);

        let reservation = keeper.reserve(30, false, &CancellationToken::none()).await.unwrap();
        assert_eq!(keeper.reserved_bytes(), 30);
        assert_eq!(keeper.current_bytes(), 0);

        reservation.commit();
        assert_eq!(keeper.reserved_bytes(), 0);
        assert_eq!(keeper.current_bytes(), 30);
    }

    #[tokio::test]
    async fn test_drop_releases_reservation() {
        let keeper = keeper(100, 80);

        let reservation = keeper.reserve(30, false, &CancellationToken::none()).await.unwrap();
        drop(reservation);

        assert_eq!(keeper.reserved_bytes(), 0);
        assert_eq!(keeper.current_bytes(), 0);
    }

    #[tokio::test]
    async fn test_oversized_reservation_fails_fast() {
        let keeper = keeper(100, 80);
        let result = keeper.reserve(101, false, &CancellationToken::none()).await;
        assert!(matches!(result, Err(StoreError::QuotaExceeded { .. })));
        assert_eq!(keeper.rejected_total(), 1);
    }

    #[tokio::test]
    async fn test_reserve_times_out_when_nothing_frees() {
        let keeper = keeper(100, 80);
        keeper.reserve(90, false, &CancellationToken::none()).await.unwrap().commit();

        let result = keeper.reserve(20, false, &CancellationToken::none()).await;
        assert!(matches!(result, Err(StoreError::QuotaExceeded { .. })));
    }

    #[tokio::test]
    async fn test_reserve_succeeds_after_eviction() {
        let keeper = keeper(100, 80);
        keeper.reserve(90, false, &CancellationToken::none()).await.unwrap().commit();

        let keeper2 = Arc::clone(&keeper);
        let waiter = tokio::spawn(async move {
            keeper2.reserve(20, false, &CancellationToken::none()).await
        });

        tokio::time::sleep(Duration::from_millis(5)).await;
        keeper.on_evicted(50);

        let reservation = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reservation.bytes(), 20);
        assert_eq!(keeper.current_bytes(), 40);
    }

    #[tokio::test]
    async fn test_reserve_observes_cancellation() {
        let keeper = keeper(100, 80);
        keeper.reserve(100, false, &CancellationToken::none()).await.unwrap().commit();

        let source = crate::cancel::CancellationSource::new();
        let token = source.token();

        let keeper2 = Arc::clone(&keeper);
        let waiter = tokio::spawn(async move { keeper2.reserve(10, false, &token).await });

        tokio::time::sleep(Duration::from_millis(5)).await;
        source.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(StoreError::Cancelled)));
    }

    #[tokio::test]
    async fn test_force_reservation_latches_request() {
        let keeper = keeper(100, 80);
        keeper
            .reserve(100, false, &CancellationToken::none())
            .await
            .unwrap()
            .commit();

        assert!(!keeper.take_force_request());

        // A force reservation that has to wait leaves a force request for
        // the purge loop even after it times out.
        let result = keeper.reserve(10, true, &CancellationToken::none()).await;
        assert!(matches!(result, Err(StoreError::QuotaExceeded { .. })));
        assert!(keeper.take_force_request());
        assert!(!keeper.take_force_request(), "request is consumed");
    }

    #[tokio::test]
    async fn test_needs_purge_and_calibrate() {
        let keeper = keeper(100, 80);
        assert!(!keeper.needs_purge());

        keeper.calibrate(85);
        assert!(keeper.needs_purge());
        assert_eq!(keeper.current_bytes(), 85);

        keeper.on_evicted(10);
        assert!(!keeper.needs_purge());
    }
}
