//! Single-stream HTTP GET (fallback when chunking is not possible).
//!
//! Writes the body sequentially. When the server honours ranges the stream
//! continues from `offset` with `Range: bytes=offset-`; otherwise the caller
//! passes offset 0 and the partial file is overwritten from the start.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicU64, Ordering};

use super::CurlOptions;
use crate::control::AbortToken;
use crate::fetch_head::ResponseHead;
use crate::retry::ChunkError;
use crate::storage::StorageWriter;

pub struct StreamFetch<'a> {
    pub url: &'a str,
    /// First byte to fetch; non-zero only for resumable streams.
    pub offset: u64,
    /// Expected total length, if known.
    pub expected: Option<u64>,
    pub storage: &'a StorageWriter,
    /// Absolute bytes written so far (offset included).
    pub written: &'a AtomicU64,
    pub abort: &'a AbortToken,
}

/// Streams the resource into `storage`. Returns the total length on disk.
///
/// A `200` to a request that resumed mid-file yields `RangeIgnored`; the
/// caller must then truncate and restart from zero.
pub fn fetch_stream(req: &StreamFetch<'_>, opts: &CurlOptions) -> Result<u64, ChunkError> {
    let head = RefCell::new(ResponseHead::default());
    let failure: RefCell<Option<ChunkError>> = RefCell::new(None);
    let checked = Cell::new(false);
    let accepted = Cell::new(false);
    req.written.store(req.offset, Ordering::Relaxed);

    let mut easy = opts.easy(req.url).map_err(ChunkError::Curl)?;
    if req.offset > 0 {
        easy.range(&format!("{}-", req.offset))
            .map_err(ChunkError::Curl)?;
    }
    easy.progress(true).map_err(ChunkError::Curl)?;

    let perform_result = {
        let mut transfer = easy.transfer();
        transfer
            .header_function(|data| {
                head.borrow_mut().push_line(data);
                true
            })
            .map_err(ChunkError::Curl)?;
        transfer
            .progress_function(|_, _, _, _| !req.abort.is_aborted())
            .map_err(ChunkError::Curl)?;
        transfer
            .write_function(|data| {
                if req.abort.is_aborted() {
                    failure.replace(Some(ChunkError::Aborted));
                    return Ok(0);
                }
                if !checked.get() {
                    checked.set(true);
                    let h = head.borrow();
                    match (h.status, req.offset) {
                        (Some(200), 0) => accepted.set(true),
                        (Some(200), _) => {
                            failure.replace(Some(ChunkError::RangeIgnored));
                            return Ok(0);
                        }
                        (Some(206), offset) => {
                            let cr = h.content_range();
                            let start = cr.and_then(|c| c.range).map(|(first, _)| first);
                            if start != Some(offset) {
                                failure.replace(Some(ChunkError::RangeMismatch {
                                    requested: format!("{}-", offset),
                                    got: h.header("content-range").map(str::to_string),
                                }));
                                return Ok(0);
                            }
                            if let (Some(expected), Some(reported)) =
                                (req.expected, cr.and_then(|c| c.total))
                            {
                                if expected != reported {
                                    failure.replace(Some(ChunkError::LengthChanged {
                                        expected,
                                        reported,
                                    }));
                                    return Ok(0);
                                }
                            }
                            accepted.set(true);
                        }
                        _ => {}
                    }
                }
                if !accepted.get() {
                    return Ok(data.len());
                }
                let off = req.written.load(Ordering::Relaxed);
                match req.storage.write_at(off, data) {
                    Ok(()) => {
                        req.written.fetch_add(data.len() as u64, Ordering::Relaxed);
                        Ok(data.len())
                    }
                    Err(e) => {
                        failure.replace(Some(ChunkError::Storage(e)));
                        Ok(0)
                    }
                }
            })
            .map_err(ChunkError::Curl)?;
        transfer.perform()
    };

    if let Err(e) = perform_result {
        if let Some(f) = failure.into_inner() {
            return Err(f);
        }
        if e.is_aborted_by_callback() {
            return Err(ChunkError::Aborted);
        }
        return Err(ChunkError::Curl(e));
    }
    if let Some(f) = failure.into_inner() {
        return Err(f);
    }

    let status = match head.borrow().status {
        Some(s) => s,
        None => easy.response_code().map_err(ChunkError::Curl)?,
    };
    match status {
        200 if req.offset == 0 => {}
        200 => return Err(ChunkError::RangeIgnored),
        206 if req.offset > 0 => {}
        code => return Err(ChunkError::Http(code)),
    }

    let written = req.written.load(Ordering::Relaxed);
    if let Some(expected) = req.expected {
        if written != expected {
            return Err(ChunkError::PartialTransfer {
                expected,
                received: written,
            });
        }
    }
    Ok(written)
}
