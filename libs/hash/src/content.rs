//! Content hash and short-hash key types.

use crate::algorithm::{HashAlgorithm, DIGEST_LEN};
use crate::error::HashError;

/// Length in bytes of the digest prefix a [`ShortHash`] keeps.
pub const SHORT_HASH_LEN: usize = 16;

/// A full content hash: `(algorithm, 32-byte digest)`.
///
/// This is the identity of one content body. The canonical string form is
/// `{algorithm}:{hex}`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash {
    algorithm: HashAlgorithm,
    digest: [u8; DIGEST_LEN],
}

impl ContentHash {
    /// Creates a hash from an algorithm and raw digest bytes.
    #[must_use]
    pub const fn new(algorithm: HashAlgorithm, digest: [u8; DIGEST_LEN]) -> Self {
        Self { algorithm, digest }
    }

    /// The algorithm that produced this hash.
    #[must_use]
    pub const fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// The raw digest bytes.
    #[must_use]
    pub const fn digest(&self) -> &[u8; DIGEST_LEN] {
        &self.digest
    }

    /// The full digest as lowercase hex.
    #[must_use]
    pub fn hex(&self) -> String {
        hex::encode(self.digest)
    }

    /// The fixed-width prefix key used for directory indexing.
    #[must_use]
    pub fn short(&self) -> ShortHash {
        let mut prefix = [0u8; SHORT_HASH_LEN];
        prefix.copy_from_slice(&self.digest[..SHORT_HASH_LEN]);
        ShortHash {
            algorithm: self.algorithm,
            prefix,
        }
    }

    /// The well-known hash of zero-byte content.
    #[must_use]
    pub fn empty(algorithm: HashAlgorithm) -> Self {
        algorithm.empty_hash()
    }

    /// Whether this is the hash of zero-byte content.
    ///
    /// The empty hash is special-cased throughout the store: it is never
    /// persisted to disk and is satisfied in memory.
    #[must_use]
    pub fn is_empty_content(&self) -> bool {
        *self == Self::empty(self.algorithm)
    }

    /// Parses a hash from its canonical `{algorithm}:{hex}` form.
    pub fn parse(s: &str) -> Result<Self, HashError> {
        if s.is_empty() {
            return Err(HashError::Empty);
        }

        let Some((algo_str, hex_str)) = s.split_once(':') else {
            return Err(HashError::MissingSeparator);
        };

        let algorithm = HashAlgorithm::parse(algo_str)?;
        Self::from_hex(algorithm, hex_str)
    }

    /// Parses the hex digest portion for a known algorithm.
    pub fn from_hex(algorithm: HashAlgorithm, hex_str: &str) -> Result<Self, HashError> {
        let bytes = hex::decode(hex_str).map_err(|e| HashError::InvalidHex(e.to_string()))?;

        if bytes.len() != DIGEST_LEN {
            return Err(HashError::WrongLength {
                expected: DIGEST_LEN,
                actual: bytes.len(),
            });
        }

        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&bytes);
        Ok(Self { algorithm, digest })
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex())
    }
}

impl std::fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Full digests drown log lines; the prefix identifies content well
        // enough for debugging.
        write!(
            f,
            "ContentHash({}:{}..)",
            self.algorithm,
            hex::encode(&self.digest[..8])
        )
    }
}

impl std::str::FromStr for ContentHash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for ContentHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// The fixed-width digest prefix the content directory indexes on.
///
/// Distinct content bodies collide on `ShortHash` only with negligible
/// probability (128 bits of prefix), but equality here is weaker than
/// [`ContentHash`] identity and the two must not be conflated.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShortHash {
    algorithm: HashAlgorithm,
    prefix: [u8; SHORT_HASH_LEN],
}

impl ShortHash {
    /// The algorithm of the full hash this key was derived from.
    #[must_use]
    pub const fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// The raw prefix bytes.
    #[must_use]
    pub const fn prefix(&self) -> &[u8; SHORT_HASH_LEN] {
        &self.prefix
    }

    /// A stable value suitable for shard selection in segmented tables.
    #[must_use]
    pub fn shard_seed(&self) -> u64 {
        u64::from_le_bytes(self.prefix[..8].try_into().unwrap())
    }
}

impl std::fmt::Display for ShortHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}..", self.algorithm, hex::encode(self.prefix))
    }
}

impl std::fmt::Debug for ShortHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ShortHash({self})")
    }
}

// =============================================================================
// Tests
// =============================================================================
