//! # hoard-hash
//!
//! Content hash types, parsing, and streaming hashers for the hoard
//! content-addressed store.
//!
//! ## Design Principles
//!
//! - Content is identified by `(algorithm, digest)`; the digest is always
//!   32 bytes regardless of algorithm
//! - All hashes have a canonical string representation with strict parsing
//! - Hashes support roundtrip serialization (parse → format → parse)
//! - The directory key is a fixed-width digest prefix (`ShortHash`), so two
//!   equality levels exist: full-hash identity and short-hash equality
//!
//! ## Hash Format
//!
//! The canonical form is `{algorithm}:{hex}` with lowercase hex:
//!
//! Examples:
//! - `sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855`
//! - `blake3:af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262`
//!
//! This format provides:
//! - Algorithm agility (the prefix names the hash function)
//! - Sortability (hex is lexicographic)
//! - Human readability (matches the convention registries use)

mod algorithm;
mod content;
mod error;
mod io;

pub use algorithm::{ContentHasher, HashAlgorithm, DIGEST_LEN};
pub use content::{ContentHash, ShortHash, SHORT_HASH_LEN};
pub use error::HashError;
pub use io::{hash_file, hash_reader};
