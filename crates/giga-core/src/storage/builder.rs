//! Builder for preallocating partial download files.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use super::writer::StorageWriter;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Wraps a freshly opened partial file. Call `preallocate` then `build` to get
/// a `StorageWriter` that supports concurrent `write_at` from many fetchers.
pub struct StorageWriterBuilder {
    file: File,
    temp_path: PathBuf,
}

impl StorageWriterBuilder {
    /// Wrap a handle obtained from a `FileProvider` for `temp_path`.
    pub fn new(file: File, temp_path: &Path) -> Self {
        StorageWriterBuilder {
            file,
            temp_path: temp_path.to_path_buf(),
        }
    }

    /// Preallocate `size` bytes. On Unix tries `posix_fallocate` for real block
    /// allocation (surfaces ENOSPC before any byte is fetched); falls back to `set_len`.
    pub fn preallocate(&mut self, size: u64) -> io::Result<()> {
        if size == 0 {
            return Ok(());
        }
        #[cfg(unix)]
        {
            let fd = self.file.as_raw_fd();
            let r = unsafe { libc::posix_fallocate(fd, 0, size as libc::off_t) };
            if r == 0 {
                return Ok(());
            }
            if r == libc::ENOSPC {
                return Err(io::Error::from_raw_os_error(r));
            }
            tracing::debug!(errno = r, "posix_fallocate failed, falling back to set_len");
        }
        self.file.set_len(size)
    }

    /// Finish building and return a writer that can be shared for concurrent writes.
    pub fn build(self) -> StorageWriter {
        StorageWriter::from_file_and_path(self.file, self.temp_path)
    }
}
