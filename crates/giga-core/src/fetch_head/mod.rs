//! Resource probing.
//!
//! Issues a one-byte ranged GET (`Range: bytes=0-0`) to learn the total
//! length from `Content-Range`, whether the server honours ranges, and the
//! ETag/Last-Modified validators used to detect a changed resource on
//! resume. A `200` answer means ranges are not supported; its body is cut
//! off after the headers.

mod parse;

pub use parse::{parse_content_range, ContentRange, ResponseHead};

use std::cell::{Cell, RefCell};

use crate::downloader::CurlOptions;
use crate::retry::{run_with_retry, ChunkError, RetryPolicy};

/// What the probe learned about the remote resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    /// Total size in bytes, if the server disclosed it.
    pub length: Option<u64>,
    /// True if the server answered the ranged probe with `206`.
    pub ranges: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// Probes `urls` in mirror order with retries.
///
/// Runs in the current thread; call from `spawn_blocking` in async code.
pub fn probe(
    urls: &[String],
    opts: &CurlOptions,
    policy: &RetryPolicy,
    halted: impl Fn() -> bool,
) -> Result<ProbeResult, ChunkError> {
    run_with_retry(
        policy,
        urls,
        halted,
        |e, attempt| tracing::warn!(attempt, "probe failed: {}", e),
        |url| probe_url(url, opts),
    )
}

/// One probe request against a single URL.
pub fn probe_url(url: &str, opts: &CurlOptions) -> Result<ProbeResult, ChunkError> {
    let head = RefCell::new(ResponseHead::default());
    let cut_body = Cell::new(false);

    let mut easy = opts.easy(url).map_err(ChunkError::Curl)?;
    easy.range("0-0").map_err(ChunkError::Curl)?;
    {
        let mut transfer = easy.transfer();
        transfer
            .header_function(|data| {
                head.borrow_mut().push_line(data);
                true
            })
            .map_err(ChunkError::Curl)?;
        transfer
            .write_function(|data| {
                if head.borrow().status == Some(200) {
                    // Full body on its way; headers are all we need.
                    cut_body.set(true);
                    return Ok(0);
                }
                Ok(data.len())
            })
            .map_err(ChunkError::Curl)?;
        match transfer.perform() {
            Ok(()) => {}
            Err(e) if e.is_write_error() && cut_body.get() => {}
            Err(e) => return Err(ChunkError::Curl(e)),
        }
    }

    let head = head.into_inner();
    let status = match head.status {
        Some(s) => s,
        None => easy.response_code().map_err(ChunkError::Curl)?,
    };
    let etag = head.etag();
    let last_modified = head.last_modified();
    tracing::debug!(url, status, "probe response");

    match status {
        206 => {
            let total = head.content_range().and_then(|cr| cr.total);
            if total == Some(0) {
                return Err(ChunkError::Http(204));
            }
            Ok(ProbeResult {
                length: total,
                ranges: true,
                etag,
                last_modified,
            })
        }
        200 => {
            let length = head.content_length();
            if length == Some(0) {
                return Err(ChunkError::Http(204));
            }
            Ok(ProbeResult {
                length,
                ranges: false,
                etag,
                last_modified,
            })
        }
        416 => match head.content_range().and_then(|cr| cr.total) {
            // Only an empty resource cannot satisfy bytes=0-0.
            Some(0) => Err(ChunkError::Http(204)),
            _ => Err(ChunkError::Http(416)),
        },
        code => Err(ChunkError::Http(code)),
    }
}
