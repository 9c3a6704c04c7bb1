//! Hash algorithm selection and streaming hashers.

use sha2::{Digest, Sha256};

use crate::content::ContentHash;
use crate::error::HashError;

/// Length in bytes of every supported digest.
pub const DIGEST_LEN: usize = 32;

/// Supported content hash algorithms.
///
/// Both algorithms produce 32-byte digests, which keeps [`ContentHash`]
/// fixed-size and `Copy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum HashAlgorithm {
    /// SHA-256. The default for interoperability with registry digests.
    #[default]
    Sha256,
    /// BLAKE3. Faster for large local content.
    Blake3,
}

impl HashAlgorithm {
    /// The canonical lowercase name used in string forms and on-disk paths.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Blake3 => "blake3",
        }
    }

    /// Parses an algorithm from its canonical name.
    pub fn parse(s: &str) -> Result<Self, HashError> {
        match s {
            "sha256" => Ok(Self::Sha256),
            "blake3" => Ok(Self::Blake3),
            other => Err(HashError::UnknownAlgorithm(other.to_string())),
        }
    }

    /// Creates a streaming hasher for this algorithm.
    #[must_use]
    pub fn hasher(&self) -> ContentHasher {
        match self {
            Self::Sha256 => ContentHasher::Sha256(Sha256::new()),
            Self::Blake3 => ContentHasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    /// The well-known hash of zero bytes under this algorithm.
    #[must_use]
    pub fn empty_hash(&self) -> ContentHash {
        self.hasher().finalize()
    }
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HashAlgorithm {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A streaming hasher that yields a [`ContentHash`] in one pass.
///
/// Content is never buffered: callers feed chunks via [`update`] and
/// finish with [`finalize`], so arbitrarily large files hash in constant
/// memory.
///
/// [`update`]: ContentHasher::update
/// [`finalize`]: ContentHasher::finalize
pub enum ContentHasher {
    Sha256(Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl ContentHasher {
    /// Feeds a chunk of content into the hasher.
    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(bytes),
            Self::Blake3(h) => {
                h.update(bytes);
            }
        }
    }

    /// Consumes the hasher and returns the content hash.
    #[must_use]
    pub fn finalize(self) -> ContentHash {
        match self {
            Self::Sha256(h) => {
                let digest: [u8; DIGEST_LEN] = h.finalize().into();
                ContentHash::new(HashAlgorithm::Sha256, digest)
            }
            Self::Blake3(h) => {
                let digest: [u8; DIGEST_LEN] = *h.finalize().as_bytes();
                ContentHash::new(HashAlgorithm::Blake3, digest)
            }
        }
    }

    /// The algorithm this hasher computes.
    #[must_use]
    pub fn algorithm(&self) -> HashAlgorithm {
        match self {
            Self::Sha256(_) => HashAlgorithm::Sha256,
            Self::Blake3(_) => HashAlgorithm::Blake3,
        }
    }
}

impl std::fmt::Debug for ContentHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ContentHasher")
            .field(&self.algorithm())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_roundtrip() {
        for algo in [HashAlgorithm::Sha256, HashAlgorithm::Blake3] {
            let parsed = HashAlgorithm::parse(algo.as_str()).unwrap();
            assert_eq!(parsed, algo);
        }
    }

    #[test]
    fn test_algorithm_unknown() {
        let result = HashAlgorithm::parse("md5");
        assert!(matches!(result, Err(HashError::UnknownAlgorithm(_))));
    }

    #[test]
    fn test_empty_hash_sha256_well_known() {
        // SHA-256 of zero bytes is a published constant.
        let empty = HashAlgorithm::Sha256.empty_hash();
        assert_eq!(
            empty.hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        for algo in [HashAlgorithm::Sha256, HashAlgorithm::Blake3] {
            let mut h1 = algo.hasher();
            h1.update(b"hello ");
            h1.update(b"world");

            let mut h2 = algo.hasher();
            h2.update(b"hello world");

            assert_eq!(h1.finalize(), h2.finalize());
        }
    }
}
