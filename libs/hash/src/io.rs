//! Chunked hashing of files and readers.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use crate::algorithm::HashAlgorithm;
use crate::content::ContentHash;

/// Chunk size for streaming hash computation.
const CHUNK_SIZE: usize = 64 * 1024;

/// Hashes a reader to completion, returning the hash and byte count.
///
/// Reads in fixed chunks so memory use stays constant regardless of
/// content size.
pub fn hash_reader<R: Read>(algorithm: HashAlgorithm, mut reader: R) -> io::Result<(ContentHash, u64)> {
    let mut hasher = algorithm.hasher();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }

    Ok((hasher.finalize(), total))
}

/// Hashes a file on disk, returning the hash and file size.
pub fn hash_file<P: AsRef<Path>>(
    algorithm: HashAlgorithm,
    path: P,
) -> io::Result<(ContentHash, u64)> {
    let file = File::open(path)?;
    hash_reader(algorithm, file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_hash_reader_matches_oneshot() {
        let content = vec![0x41u8; 200_000]; // spans multiple chunks
        let (streamed, size) = hash_reader(HashAlgorithm::Sha256, &content[..]).unwrap();
        assert_eq!(size, 200_000);

        let mut hasher = HashAlgorithm::Sha256.hasher();
        hasher.update(&content);
        assert_eq!(streamed, hasher.finalize());
    }

    #[test]
    fn test_hash_empty_reader() {
        let (hash, size) = hash_reader(HashAlgorithm::Sha256, &[][..]).unwrap();
        assert_eq!(size, 0);
        assert!(hash.is_empty_content());
    }

    #[test]
    fn test_hash_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("content");
        let mut file = File::create(&path).unwrap();
        file.write_all(b"file body").unwrap();
        drop(file);

        let (from_file, size) = hash_file(HashAlgorithm::Blake3, &path).unwrap();
        assert_eq!(size, 9);

        let (from_reader, _) = hash_reader(HashAlgorithm::Blake3, &b"file body"[..]).unwrap();
        assert_eq!(from_file, from_reader);
    }
}
