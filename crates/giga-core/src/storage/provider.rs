//! Capability provider for destination files.
//!
//! The engine never creates files on its own authority: it asks a
//! `FileProvider` for a writable handle at `(location, name)`. A denial is
//! reported to the caller as `WritePermissionDenied`.

use std::fs::{self, File};
use std::io;
use std::path::Path;

use crate::mission::ErrorCode;

/// How a partial file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Create or truncate (fresh download).
    Create,
    /// Open an existing partial file for resume; fails if it is missing.
    Existing,
}

#[derive(Debug)]
pub enum FileAccessError {
    /// The host refused write access.
    Denied(io::Error),
    /// `OpenMode::Existing` and the file is gone.
    Missing,
    /// Any other I/O failure (disk full, bad path).
    Io(io::Error),
}

impl FileAccessError {
    pub fn from_io(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::PermissionDenied => FileAccessError::Denied(e),
            io::ErrorKind::NotFound => FileAccessError::Missing,
            _ => FileAccessError::Io(e),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            FileAccessError::Denied(_) => ErrorCode::PermissionDenied,
            FileAccessError::Missing => ErrorCode::ProgressLost,
            FileAccessError::Io(e) => ErrorCode::from_io(e),
        }
    }
}

impl std::fmt::Display for FileAccessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileAccessError::Denied(e) => write!(f, "write permission denied: {}", e),
            FileAccessError::Missing => write!(f, "partial file is missing"),
            FileAccessError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for FileAccessError {}

pub trait FileProvider: Send + Sync {
    /// Makes sure the destination directory exists and may be written.
    fn prepare_location(&self, location: &Path) -> Result<(), FileAccessError>;

    /// Returns a read/write handle to `path`.
    fn open(&self, path: &Path, mode: OpenMode) -> Result<File, FileAccessError>;

    /// Removes a file; a missing file is not an error.
    fn remove(&self, path: &Path) -> io::Result<()> {
        match fs::remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Plain local filesystem access.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFiles;

impl FileProvider for LocalFiles {
    fn prepare_location(&self, location: &Path) -> Result<(), FileAccessError> {
        fs::create_dir_all(location).map_err(|e| match e.kind() {
            io::ErrorKind::PermissionDenied => FileAccessError::Denied(e),
            _ => FileAccessError::Io(e),
        })?;
        let meta = fs::metadata(location).map_err(FileAccessError::Io)?;
        if meta.permissions().readonly() {
            return Err(FileAccessError::Denied(io::Error::from(
                io::ErrorKind::PermissionDenied,
            )));
        }
        Ok(())
    }

    fn open(&self, path: &Path, mode: OpenMode) -> Result<File, FileAccessError> {
        let mut opts = File::options();
        opts.read(true).write(true);
        if mode == OpenMode::Create {
            opts.create(true).truncate(true);
        }
        opts.open(path).map_err(FileAccessError::from_io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn existing_mode_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = LocalFiles
            .open(&dir.path().join("nope.part"), OpenMode::Existing)
            .unwrap_err();
        assert!(matches!(err, FileAccessError::Missing));
        assert_eq!(err.code(), ErrorCode::ProgressLost);
    }

    #[test]
    fn prepare_creates_nested_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        LocalFiles.prepare_location(&nested).unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn remove_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        LocalFiles.remove(&dir.path().join("gone")).unwrap();
    }
}
