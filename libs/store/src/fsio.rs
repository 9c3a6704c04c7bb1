//! Filesystem primitives with the error granularity the store needs.
//!
//! Hardlink failures must be told apart: hitting the per-inode link limit
//! triggers replica expansion, a missing source triggers self-healing, and
//! a cross-volume request falls back to copying. Raw `io::Error` does not
//! carry that distinction portably, so classification happens here against
//! errno.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use thiserror::Error;
use tracing::debug;

use hoard_hash::{ContentHash, HashAlgorithm};

/// Buffer size for streamed copies.
const COPY_CHUNK: usize = 64 * 1024;

/// Classified hardlink failures.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The link source does not exist.
    #[error("hardlink source missing")]
    SourceMissing,

    /// The link destination already exists.
    #[error("hardlink destination exists")]
    DestinationExists,

    /// The source inode is at the OS hardlink limit.
    #[error("hardlink count limit reached")]
    MaxLinkLimit,

    /// Source and destination are on different volumes.
    #[error("hardlink across volumes")]
    DifferentVolume,

    /// Permission denied.
    #[error("hardlink access denied")]
    AccessDenied,

    /// The filesystem does not support hardlinks.
    #[error("hardlinks not supported")]
    NotSupported,

    /// Anything else.
    #[error("hardlink failed: {0}")]
    Other(io::Error),
}

/// Creates a hardlink, classifying the failure mode.
pub fn hard_link(src: &Path, dst: &Path) -> Result<(), LinkError> {
    match fs::hard_link(src, dst) {
        Ok(()) => Ok(()),
        Err(e) => Err(classify_link_error(e)),
    }
}

fn classify_link_error(e: io::Error) -> LinkError {
    match e.raw_os_error() {
        Some(libc::EMLINK) => LinkError::MaxLinkLimit,
        Some(libc::ENOENT) => LinkError::SourceMissing,
        Some(libc::EEXIST) => LinkError::DestinationExists,
        Some(libc::EXDEV) => LinkError::DifferentVolume,
        Some(libc::EACCES) | Some(libc::EPERM) => LinkError::AccessDenied,
        Some(libc::EOPNOTSUPP) => LinkError::NotSupported,
        _ => LinkError::Other(e),
    }
}

/// Number of hardlinks to a file's inode.
pub fn link_count(path: &Path) -> io::Result<u64> {
    Ok(fs::metadata(path)?.nlink())
}

/// Whether two paths live on the same volume (device).
///
/// The destination may not exist yet; its parent directory decides.
pub fn same_volume(a: &Path, b: &Path) -> io::Result<bool> {
    let dev_of = |p: &Path| -> io::Result<u64> {
        match fs::metadata(p) {
            Ok(m) => Ok(m.dev()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let parent = p
                    .parent()
                    .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no parent"))?;
                Ok(fs::metadata(parent)?.dev())
            }
            Err(e) => Err(e),
        }
    };
    Ok(dev_of(a)? == dev_of(b)?)
}

/// Applies or removes read-only attributes on a blob. Best-effort callers
/// ignore the result.
pub fn set_deny_writes(path: &Path, deny: bool) -> io::Result<()> {
    let mode = if deny { 0o444 } else { 0o644 };
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

/// Streams `src` into `dst`, hashing while copying. Returns the hash and
/// byte count. The destination is synced before returning.
pub fn copy_and_hash(
    src: &Path,
    dst: &Path,
    algorithm: HashAlgorithm,
) -> io::Result<(ContentHash, u64)> {
    let mut reader = File::open(src)?;
    let mut writer = File::create(dst)?;
    let mut hasher = algorithm.hasher();
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }

    writer.sync_all()?;
    Ok((hasher.finalize(), total))
}

/// Streams `src` into `dst` without hashing.
pub fn copy_file(src: &Path, dst: &Path) -> io::Result<u64> {
    let mut reader = File::open(src)?;
    let mut writer = File::create(dst)?;
    let total = io::copy(&mut reader, &mut writer)?;
    writer.sync_all()?;
    Ok(total)
}

/// Removes a file, unlocking read-only attributes first if needed.
pub fn remove_blob(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EACCES) || e.raw_os_error() == Some(libc::EPERM) => {
            set_deny_writes(path, false)?;
            fs::remove_file(path)
        }
        Err(e) => Err(e),
    }
}

/// Empties a directory of files, creating it if missing. Subdirectories
/// are removed recursively. Used for `temp/` at startup and shutdown.
pub fn clean_dir(dir: &Path) -> io::Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        return Ok(());
    }

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let removed = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            remove_blob(&path)
        };
        if let Err(e) = removed {
            debug!(path = %path.display(), error = %e, "Leaving file behind during cleanup");
        }
    }

    Ok(())
}
