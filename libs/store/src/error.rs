//! Error types for store operations.

use std::io;
use std::path::PathBuf;

use hoard_hash::{ContentHash, HashError};
use thiserror::Error;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Invalid or missing configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// A reservation could not be satisfied within the wait budget.
    #[error("quota exceeded: {requested} bytes requested, hard cap {hard_cap} bytes")]
    QuotaExceeded { requested: u64, hard_cap: u64 },

    /// Computed content hash does not match the expected hash.
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },

    /// Declared content size does not match the file on disk.
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// The source file for an ingest does not exist.
    #[error("source not found: {0}")]
    SourceNotFound(PathBuf),

    /// The placement destination already exists.
    #[error("destination exists: {0}")]
    DestinationExists(PathBuf),

    /// Access to a path was denied.
    #[error("access denied: {0}")]
    AccessDenied(PathBuf),

    /// Hardlinks are not supported by the underlying filesystem.
    #[error("hardlinks not supported by the filesystem")]
    HardLinkUnsupported,

    /// Source and destination are on different volumes.
    #[error("source and destination are on different volumes")]
    DifferentVolume,

    /// The requested content is not in the store.
    #[error("content not found: {0}")]
    ContentNotFound(ContentHash),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The on-disk directory snapshot has an unknown or corrupt format.
    #[error("directory snapshot format error: {0}")]
    DirectoryFormat(String),

    /// Hash parsing or validation failed.
    #[error("hash error: {0}")]
    Hash(#[from] HashError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience alias used throughout the store.
pub type Result<T> = std::result::Result<T, StoreError>;
