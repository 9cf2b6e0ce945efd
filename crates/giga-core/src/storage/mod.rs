//! Disk I/O and file lifecycle.
//!
//! Preallocates partial files (fallocate on Linux when available, else
//! set_len), supports concurrent offset writes (pwrite), fsync, and atomic
//! finalize (rename from `.part` to the final name). Handles come from a
//! [`FileProvider`] so embedders can gate write access.

mod builder;
mod provider;
mod writer;

pub use builder::StorageWriterBuilder;
pub use provider::{FileAccessError, FileProvider, LocalFiles, OpenMode};
pub use writer::StorageWriter;

use std::path::{Path, PathBuf};

/// Temporary file suffix used before atomic rename.
pub const TEMP_SUFFIX: &str = ".part";

/// Path for the temp file: appends `.part` to the final path (e.g. `file.iso` → `file.iso.part`).
pub fn temp_path(final_path: &Path) -> PathBuf {
    let mut o = final_path.as_os_str().to_owned();
    o.push(TEMP_SUFFIX);
    PathBuf::from(o)
}
