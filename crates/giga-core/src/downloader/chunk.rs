//! One chunk: ranged GET, validate, write at offset.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicU64, Ordering};

use super::gate::RangeGate;
use super::CurlOptions;
use crate::control::AbortToken;
use crate::fetch_head::{ContentRange, ResponseHead};
use crate::retry::ChunkError;
use crate::segmenter::Chunk;
use crate::storage::StorageWriter;

/// Everything a fetcher needs for one attempt at one chunk.
pub struct ChunkFetch<'a> {
    pub url: &'a str,
    pub chunk: Chunk,
    /// Length of the whole resource, checked against `Content-Range`.
    pub total: u64,
    pub storage: &'a StorageWriter,
    /// Bytes of this chunk written by this attempt (read by the progress reporter).
    pub written: &'a AtomicU64,
    pub abort: &'a AbortToken,
    pub gate: &'a RangeGate,
}

/// Checks the `Content-Range` of a `206` against the requested chunk.
fn check_content_range(head: &ResponseHead, chunk: Chunk, total: u64) -> Result<(), ChunkError> {
    let mismatch = || ChunkError::RangeMismatch {
        requested: chunk.curl_range(),
        got: head.header("content-range").map(str::to_string),
    };
    match head.content_range() {
        Some(ContentRange {
            range: Some((first, last)),
            total: reported,
        }) => {
            if let Some(reported) = reported {
                if reported != total {
                    return Err(ChunkError::LengthChanged {
                        expected: total,
                        reported,
                    });
                }
            }
            if first != chunk.start || last + 1 != chunk.end {
                return Err(mismatch());
            }
            Ok(())
        }
        _ => Err(mismatch()),
    }
}

/// Downloads one chunk: GET with `Range`, body written at the chunk offset.
///
/// A `200` answer closes the gate and returns `RangeIgnored` before a single
/// byte is written. The abort token is checked after every buffer and from
/// the libcurl progress callback. Returns `ChunkError` so callers can
/// classify and retry.
pub fn fetch_chunk(req: &ChunkFetch<'_>, opts: &CurlOptions) -> Result<(), ChunkError> {
    let chunk = req.chunk;
    let head = RefCell::new(ResponseHead::default());
    let failure: RefCell<Option<ChunkError>> = RefCell::new(None);
    let checked = Cell::new(false);
    req.written.store(0, Ordering::Relaxed);

    let mut easy = opts.easy(req.url).map_err(ChunkError::Curl)?;
    easy.range(&chunk.curl_range()).map_err(ChunkError::Curl)?;
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
                let status = head.borrow().status;
                if !checked.get() {
                    checked.set(true);
                    match status {
                        Some(206) => {
                            if let Err(e) = check_content_range(&head.borrow(), chunk, req.total) {
                                failure.replace(Some(e));
                                return Ok(0);
                            }
                            req.gate.open();
                        }
                        Some(200) => {
                            req.gate.close();
                            failure.replace(Some(ChunkError::RangeIgnored));
                            return Ok(0);
                        }
                        _ => {}
                    }
                }
                if status != Some(206) {
                    // Error page body; the status is reported after perform.
                    return Ok(data.len());
                }
                let off = req.written.load(Ordering::Relaxed);
                if off + data.len() as u64 > chunk.len() {
                    failure.replace(Some(ChunkError::RangeMismatch {
                        requested: chunk.curl_range(),
                        got: Some(format!("more than {} bytes", chunk.len())),
                    }));
                    return Ok(0);
                }
                match req.storage.write_at(chunk.start + off, data) {
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

    let head = head.into_inner();
    let status = match head.status {
        Some(s) => s,
        None => easy.response_code().map_err(ChunkError::Curl)?,
    };
    match status {
        206 => {
            if !checked.get() {
                check_content_range(&head, chunk, req.total)?;
                req.gate.open();
            }
        }
        200 => {
            req.gate.close();
            return Err(ChunkError::RangeIgnored);
        }
        416 => {
            return match head.content_range().and_then(|cr| cr.total) {
                Some(reported) if reported != req.total => Err(ChunkError::LengthChanged {
                    expected: req.total,
                    reported,
                }),
                _ => Err(ChunkError::Http(416)),
            };
        }
        code => return Err(ChunkError::Http(code)),
    }

    let received = req.written.load(Ordering::Relaxed);
    let expected = chunk.len();
    if received != expected {
        return Err(ChunkError::PartialTransfer { expected, received });
    }
    Ok(())
}
