//! On-disk layout of the store sandbox.
//!
//! ```text
//! <root>/Shared/<algo>/<first-3-hex>/<full-hex>.blob       replica 0 (primary)
//! <root>/Shared/<algo>/<first-3-hex>/<full-hex>.<N>.blob   replica N >= 1
//! <root>/temp/<random-12-hex>                              staging files
//! ```
//!
//! The three-hex-char fan-out directory keeps per-directory entry counts
//! manageable for stores holding millions of blobs.

use std::path::{Path, PathBuf};

use hoard_hash::{ContentHash, HashAlgorithm};
use rand::RngCore;

/// Directory under the root that holds blob content.
pub const SHARED_DIR: &str = "Shared";

/// Directory under the root for staging and quarantined files.
pub const TEMP_DIR: &str = "temp";

/// Extension of every blob file.
pub const BLOB_EXT: &str = "blob";

/// Resolves hashes to blob paths and back.
#[derive(Debug, Clone)]
pub struct BlobLayout {
    root: PathBuf,
}

impl BlobLayout {
    /// Creates a layout rooted at the given directory.
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// The sandbox root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The shared content directory.
    pub fn shared_dir(&self) -> PathBuf {
        self.root.join(SHARED_DIR)
    }

    /// The staging/quarantine directory.
    pub fn temp_dir(&self) -> PathBuf {
        self.root.join(TEMP_DIR)
    }

    /// The fan-out directory holding a hash's replicas.
    pub fn blob_dir(&self, hash: &ContentHash) -> PathBuf {
        let hex = hash.hex();
        self.shared_dir()
            .join(hash.algorithm().as_str())
            .join(&hex[..3])
    }

    /// Path of replica 0, the canonical file for a hash.
    pub fn primary(&self, hash: &ContentHash) -> PathBuf {
        self.blob_dir(hash)
            .join(format!("{}.{BLOB_EXT}", hash.hex()))
    }

    /// Path of replica `n`. Replica 0 is the primary.
    pub fn replica(&self, hash: &ContentHash, n: u32) -> PathBuf {
        if n == 0 {
            return self.primary(hash);
        }
        self.blob_dir(hash)
            .join(format!("{}.{n}.{BLOB_EXT}", hash.hex()))
    }

    /// Extracts the content hash a blob path encodes.
    ///
    /// The algorithm comes from the grandparent directory name and the hex
    /// from the filename prefix before the first dot. Foreign or renamed
    /// files yield `None`.
    pub fn parse(&self, path: &Path) -> Option<ContentHash> {
        let name = path.file_name()?.to_str()?;
        if !name.ends_with(&format!(".{BLOB_EXT}")) {
            return None;
        }
        let hex = name.split('.').next()?;

        let algo_name = path.parent()?.parent()?.file_name()?.to_str()?;
        let algorithm = HashAlgorithm::parse(algo_name).ok()?;

        ContentHash::from_hex(algorithm, hex).ok()
    }

    /// Extracts the replica index a blob path encodes.
    ///
    /// `hex.blob` is replica 0, `hex.N.blob` is replica N. Anything else
    /// is not a well-formed blob name.
    pub fn replica_index(&self, path: &Path) -> Option<u32> {
        let name = path.file_name()?.to_str()?;
        let parts: Vec<&str> = name.split('.').collect();
        match parts.as_slice() {
            [_, ext] if *ext == BLOB_EXT => Some(0),
            [_, n, ext] if *ext == BLOB_EXT => n.parse().ok(),
            _ => None,
        }
    }

    /// A fresh collision-free staging path under `temp/`.
    pub fn temp_file(&self) -> PathBuf {
        let mut bytes = [0u8; 6];
        rand::rng().fill_bytes(&mut bytes);
        self.temp_dir().join(hex::encode(bytes))
    }

    /// Scans the shared directory, yielding `(hash, replica_index, size,
    /// path)` for every well-formed blob file.
    ///
    /// Files that do not decode to a blob name are skipped; the self-check
    /// pass is the one that quarantines them.
    pub fn scan_blobs(&self) -> std::io::Result<Vec<ScannedBlob>> {
        let mut found = Vec::new();
        let shared = self.shared_dir();
        if !shared.exists() {
            return Ok(found);
        }

        for algo_entry in std::fs::read_dir(&shared)? {
            let algo_dir = algo_entry?.path();
            if !algo_dir.is_dir() {
                continue;
            }
            for fan_entry in std::fs::read_dir(&algo_dir)? {
                let fan_dir = fan_entry?.path();
                if !fan_dir.is_dir() {
                    continue;
                }
                for blob_entry in std::fs::read_dir(&fan_dir)? {
                    let blob_entry = blob_entry?;
                    let path = blob_entry.path();
                    let (Some(hash), Some(replica)) =
                        (self.parse(&path), self.replica_index(&path))
                    else {
                        continue;
                    };
                    let size = blob_entry.metadata()?.len();
                    found.push(ScannedBlob {
                        hash,
                        replica,
                        size,
                        path,
                    });
                }
            }
        }

        Ok(found)
    }
}

/// One blob file discovered by a shared-directory scan.
#[derive(Debug, Clone)]
pub struct ScannedBlob {
    pub hash: ContentHash,
    pub replica: u32,
    pub size: u64,
    pub path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use hoard_hash::HashAlgorithm;

    fn sample_hash() -> ContentHash {
        let mut hasher = HashAlgorithm::Sha256.hasher();
        hasher.update(b"layout test");
        hasher.finalize()
    }

    #[test]
    fn test_primary_path_shape() {
        let layout = BlobLayout::new("/cache");
        let hash = sample_hash();
        let hex = hash.hex();

        let primary = layout.primary(&hash);
        assert_eq!(
            primary,
            PathBuf::from(format!("/cache/Shared/sha256/{}/{}.blob", &hex[..3], hex))
        );
    }

    #[test]
    fn test_replica_path_shape() {
        let layout = BlobLayout::new("/cache");
        let hash = sample_hash();
        let hex = hash.hex();

        assert_eq!(layout.replica(&hash, 0), layout.primary(&hash));
        assert_eq!(
            layout.replica(&hash, 3),
            PathBuf::from(format!("/cache/Shared/sha256/{}/{}.3.blob", &hex[..3], hex))
        );
    }

    #[test]
    fn test_parse_roundtrip() {
        let layout = BlobLayout::new("/cache");
        let hash = sample_hash();

        assert_eq!(layout.parse(&layout.primary(&hash)), Some(hash));
        assert_eq!(layout.parse(&layout.replica(&hash, 7)), Some(hash));
    }

    #[test]
    fn test_parse_rejects_foreign_files() {
        let layout = BlobLayout::new("/cache");
        assert_eq!(layout.parse(Path::new("/cache/Shared/sha256/abc/notes.txt")), None);
        assert_eq!(layout.parse(Path::new("/cache/Shared/md5/abc/deadbeef.blob")), None);
        assert_eq!(layout.parse(Path::new("/somewhere/else.blob")), None);
    }

    #[test]
    fn test_replica_index() {
        let layout = BlobLayout::new("/cache");
        let hash = sample_hash();

        assert_eq!(layout.replica_index(&layout.primary(&hash)), Some(0));
        assert_eq!(layout.replica_index(&layout.replica(&hash, 12)), Some(12));
        assert_eq!(layout.replica_index(Path::new("junk.txt")), None);
        assert_eq!(layout.replica_index(Path::new("a.b.c.blob")), None);
    }

    #[test]
    fn test_temp_names_are_unique() {
        let layout = BlobLayout::new("/cache");
        let a = layout.temp_file();
        let b = layout.temp_file();
        assert_ne!(a, b);
        assert!(a.starts_with("/cache/temp"));
        assert_eq!(a.file_name().unwrap().len(), 12);
    }
}
