//! Error types for hash parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating content hashes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HashError {
    /// The hash string is empty.
    #[error("hash cannot be empty")]
    Empty,

    /// The hash is missing the `algorithm:` separator.
    #[error("hash missing ':' separator")]
    MissingSeparator,

    /// The algorithm name is not recognized.
    #[error("unknown hash algorithm: '{0}'")]
    UnknownAlgorithm(String),

    /// The hex portion of the hash is not valid hex.
    #[error("invalid hex: {0}")]
    InvalidHex(String),

    /// The digest has the wrong length for the algorithm.
    #[error("wrong digest length: expected {expected} bytes, got {actual}")]
    WrongLength { expected: usize, actual: usize },
}

impl HashError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, HashError::Empty)
    }

    /// Returns true if this error indicates an unparseable algorithm prefix.
    pub fn is_algorithm_error(&self) -> bool {
        matches!(
            self,
            HashError::UnknownAlgorithm(_) | HashError::MissingSeparator
        )
    }
}
