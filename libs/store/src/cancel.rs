//! Cancellation signals for store operations.
//!
//! Two signals compose: a store-wide shutdown source and a per-operation
//! source. Operations observe the union and check it between units of work,
//! so a long eviction pass or ingest stops at the next consistent point.

use tokio::sync::watch;

use crate::error::{Result, StoreError};

/// The owning side of a cancellation signal.
#[derive(Debug)]
pub struct CancellationSource {
    tx: watch::Sender<bool>,
}

impl CancellationSource {
    /// Creates a fresh, untriggered source.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Returns a token observing this source.
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            primary: Some(self.tx.subscribe()),
            secondary: None,
        }
    }

    /// Triggers cancellation. All tokens observe it.
    pub fn cancel(&self) {
        // Receivers may already be gone; nothing to do then.
        let _ = self.tx.send(true);
    }

    /// Whether this source has been triggered.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

/// An observer of up to two cancellation sources.
///
/// Tokens are cheap to clone. A token with no sources never cancels, which
/// is the form callers pass when they have no cancellation requirement.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    primary: Option<watch::Receiver<bool>>,
    secondary: Option<watch::Receiver<bool>>,
}

impl CancellationToken {
    /// A token that never cancels.
    pub fn none() -> Self {
        Self::default()
    }

    /// Combines this token with another; the result cancels when either
    /// does. At most two underlying sources are observed, which covers the
    /// store-wide + per-operation pairing.
    pub fn merged(&self, other: &CancellationToken) -> Self {
        let mut slots = [
            self.primary.clone(),
            self.secondary.clone(),
            other.primary.clone(),
            other.secondary.clone(),
        ]
        .into_iter()
        .flatten();

        Self {
            primary: slots.next(),
            secondary: slots.next(),
        }
    }

    /// Whether any observed source has been triggered.
    pub fn is_cancelled(&self) -> bool {
        let triggered = |rx: &Option<watch::Receiver<bool>>| {
            rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
        };
        triggered(&self.primary) || triggered(&self.secondary)
    }

    /// Returns `Err(Cancelled)` if any observed source has been triggered.
    pub fn err_if_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(StoreError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves when cancellation is observed. Pends forever on a token
    /// with no live sources.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }

        let mut primary = self.primary.clone();
        let mut secondary = self.secondary.clone();

        // A receiver whose source is gone can never trigger; treat it as
        // absent from then on.
        let mut primary_live = primary.is_some();
        let mut secondary_live = secondary.is_some();

        loop {
            match (primary_live, secondary_live) {
                (true, true) => {
                    let a = primary.as_mut().unwrap();
                    let b = secondary.as_mut().unwrap();
                    tokio::select! {
                        triggered = watch_for_trigger(a) => {
                            if triggered {
                                return;
                            }
                            primary_live = false;
                        }
                        triggered = watch_for_trigger(b) => {
                            if triggered {
                                return;
                            }
                            secondary_live = false;
                        }
                    }
                }
                (true, false) => {
                    if watch_for_trigger(primary.as_mut().unwrap()).await {
                        return;
                    }
                    primary_live = false;
                }
                (false, true) => {
                    if watch_for_trigger(secondary.as_mut().unwrap()).await {
                        return;
                    }
                    secondary_live = false;
                }
                (false, false) => std::future::pending::<()>().await,
            }
        }
    }
}

/// Waits until the receiver sees `true` (returns `true`) or its sender is
/// dropped without ever triggering (returns `false`).
async fn watch_for_trigger(rx: &mut watch::Receiver<bool>) -> bool {
    loop {
        if *rx.borrow_and_update() {
            return true;
        }
        if rx.changed().await.is_err() {
            return false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_token_observes_source() {
        let source = CancellationSource::new();
        let token = source.token();

        assert!(!token.is_cancelled());
        source.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(
            token.err_if_cancelled(),
            Err(StoreError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_none_token_never_cancels() {
        let token = CancellationToken::none();
        assert!(!token.is_cancelled());

        let waited = tokio::time::timeout(Duration::from_millis(20), token.cancelled()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_merged_cancels_on_either() {
        let store_wide = CancellationSource::new();
        let per_op = CancellationSource::new();
        let merged = store_wide.token().merged(&per_op.token());

        assert!(!merged.is_cancelled());
        per_op.cancel();
        assert!(merged.is_cancelled());

        let merged = store_wide.token().merged(&CancellationSource::new().token());
        store_wide.cancel();
        assert!(merged.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let source = CancellationSource::new();
        let token = source.token();

        let wait = tokio::spawn(async move { token.cancelled().await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        source.cancel();

        tokio::time::timeout(Duration::from_secs(1), wait)
            .await
            .expect("cancelled() should resolve")
            .unwrap();
    }
}
