//! Collaborator seams for content change notifications.
//!
//! The store announces adds and evictions to whoever composes it. The peer
//! layer uses these hooks to keep distributed location records current;
//! nothing in the core depends on them succeeding, and they are always
//! invoked outside hash locks.

use async_trait::async_trait;
use hoard_hash::ContentHash;

/// Receives add/evict announcements. Fire-and-forget.
#[async_trait]
pub trait ChangeAnnouncer: Send + Sync {
    /// Content was committed to the store.
    async fn content_added(&self, hash: ContentHash, size: u64);

    /// Content was removed from the store.
    async fn content_evicted(&self, hash: ContentHash, size: u64);
}

/// Announcer that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAnnouncer;

#[async_trait]
impl ChangeAnnouncer for NullAnnouncer {
    async fn content_added(&self, _hash: ContentHash, _size: u64) {}

    async fn content_evicted(&self, _hash: ContentHash, _size: u64) {}
}

/// Optional distributed-location hook: evicted hashes are unregistered so
/// peers stop serving stale locations.
#[async_trait]
pub trait LocationStore: Send + Sync {
    /// Removes this machine as a location for the given hashes.
    async fn unregister(&self, hashes: &[ContentHash]);
}
