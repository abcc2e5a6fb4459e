//! Identity resolution for watched paths.
//!
//! A target's identity is the storage object behind its path, not the path
//! string. Comparing identities is how a delete+recreate or a rename-over is
//! told apart from "nothing happened", even when the path never changes.

use std::fs::{self, Metadata};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Opaque identity of a storage object (device + inode on Unix).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId {
    dev: u64,
    ino: u64,
}

impl FileId {
    #[cfg(unix)]
    fn from_metadata(meta: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        Self {
            dev: meta.dev(),
            ino: meta.ino(),
        }
    }

    // No stable file index outside Unix. The creation time survives in-place
    // writes and changes on rename-over, which is what the watcher needs.
    #[cfg(not(unix))]
    fn from_metadata(meta: &Metadata) -> Self {
        let ino = meta
            .created()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(saturating_nanos)
            .unwrap_or_default();

        Self { dev: 0, ino }
    }
}

/// Nanoseconds in `d`, clamped to `u64::MAX` instead of wrapping.
#[cfg(any(not(unix), test))]
fn saturating_nanos(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// What kind of object a target is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    File,
    Directory,
}

/// Result of a successful resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub id: FileId,
    pub kind: TargetKind,
}

/// Why a path could not be resolved.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("path does not exist")]
    NotFound,

    #[error("symbolic link at {path}")]
    UnsupportedSymlink { path: PathBuf },

    #[error("cannot stat {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Resolve the identity and kind of `path` without following links.
///
/// A link at `path` itself or at any of its ancestors is rejected.
pub fn resolve(path: &Path) -> Result<Resolved, ResolveError> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(ResolveError::NotFound),
        Err(source) => {
            return Err(ResolveError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    if meta.file_type().is_symlink() {
        return Err(ResolveError::UnsupportedSymlink {
            path: path.to_path_buf(),
        });
    }

    if let Some(link) = symlinked_ancestor(path) {
        return Err(ResolveError::UnsupportedSymlink { path: link });
    }

    let kind = if meta.is_dir() {
        TargetKind::Directory
    } else {
        TargetKind::File
    };

    Ok(Resolved {
        id: FileId::from_metadata(&meta),
        kind,
    })
}

/// Identity of a directory entry, or `None` if it is gone.
///
/// Unlike [`resolve`] this accepts links: an entry inside a watched directory
/// is only identified, never followed.
pub(crate) fn entry_id(path: &Path) -> Option<FileId> {
    fs::symlink_metadata(path)
        .ok()
        .map(|meta| FileId::from_metadata(&meta))
}

fn symlinked_ancestor(path: &Path) -> Option<PathBuf> {
    path.ancestors()
        .skip(1)
        .filter(|ancestor| !ancestor.as_os_str().is_empty())
        .find(|ancestor| {
            fs::symlink_metadata(ancestor)
                .map(|meta| meta.file_type().is_symlink())
                .unwrap_or(false)
        })
        .map(Path::to_path_buf)
}
