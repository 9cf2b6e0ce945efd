//! Minimal HTTP/1.1 server that supports Range GET for integration tests.
//!
//! Serves a single static body with fault injection: a range start can fail
//! with 500 a number of times (or forever), ranges can be ignored (except
//! for the one-byte probe), every request can get a fixed status, the body
//! can be throttled or swapped for another after some requests, and chunk
//! responses can report a wrong total. Every GET is counted per requested
//! range.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RangeServerOptions {
    /// If false, GET ignores Range and always returns 200 with the full body.
    pub support_ranges: bool,
    /// Honour `Range: bytes=0-0` even when `support_ranges` is false
    /// (a server that passes the probe and then ignores chunk ranges).
    pub honour_probe: bool,
    /// Requests whose range starts here fail with 500...
    pub fail_start: Option<u64>,
    /// ...this many times (`usize::MAX` = always).
    pub fail_times: usize,
    /// Answer every request with this status and no body.
    pub status: Option<u16>,
    /// Pause between 1 KiB body writes.
    pub throttle: Option<Duration>,
    pub etag: Option<String>,
    /// From the n-th GET on (0-based), serve this body instead.
    pub swap_body: Option<(usize, Vec<u8>)>,
    /// Ranged responses other than `bytes=0-0` claim a total one byte longer.
    pub misreport_total: bool,
}

impl Default for RangeServerOptions {
    fn default() -> Self {
        Self {
            support_ranges: true,
            honour_probe: false,
            fail_start: None,
            fail_times: 0,
            status: None,
            throttle: None,
            etag: None,
            swap_body: None,
            misreport_total: false,
        }
    }
}

/// Requested range of one GET: `(start, end_inclusive)`, `None` without Range.
pub type RangeKey = Option<(u64, u64)>;

pub struct RangeServer {
    pub url: String,
    hits: Arc<Mutex<HashMap<RangeKey, usize>>>,
}

impl RangeServer {
    /// GETs that asked for exactly `start..=end`.
    pub fn hits(&self, start: u64, end_incl: u64) -> usize {
        self.hits
            .lock()
            .unwrap()
            .get(&Some((start, end_incl)))
            .copied()
            .unwrap_or(0)
    }

    /// GETs sent without a Range header.
    pub fn full_hits(&self) -> usize {
        self.hits.lock().unwrap().get(&None).copied().unwrap_or(0)
    }

    /// Every ranged GET, whatever range it asked for.
    pub fn ranged_hits(&self) -> usize {
        self.hits
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k.is_some())
            .map(|(_, n)| n)
            .sum()
    }

    pub fn total_hits(&self) -> usize {
        self.hits.lock().unwrap().values().sum()
    }
}

struct Shared {
    body: Vec<u8>,
    opts: RangeServerOptions,
    failures_left: Mutex<usize>,
    requests: AtomicUsize,
    hits: Arc<Mutex<HashMap<RangeKey, usize>>>,
}

pub fn start(body: Vec<u8>) -> RangeServer {
    start_with_options(body, RangeServerOptions::default())
}

/// Starts a server in a background thread. It runs until the process exits.
pub fn start_with_options(body: Vec<u8>, opts: RangeServerOptions) -> RangeServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let hits = Arc::new(Mutex::new(HashMap::new()));
    let shared = Arc::new(Shared {
        body,
        failures_left: Mutex::new(opts.fail_times),
        requests: AtomicUsize::new(0),
        opts,
        hits: Arc::clone(&hits),
    });
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let shared = Arc::clone(&shared);
            thread::spawn(move || handle(stream, &shared));
        }
    });
    RangeServer {
        url: format!("http://127.0.0.1:{}/file.bin", port),
        hits,
    }
}

fn read_head(stream: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::with_capacity(1024);
    let mut byte = [0u8; 512];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut byte).ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&byte[..n]);
    }
    String::from_utf8(buf).ok()
}

fn handle(mut stream: TcpStream, shared: &Shared) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(5)));
    let Some(request) = read_head(&mut stream) else {
        return;
    };
    let (method, range) = parse_request(&request);
    if !method.eq_ignore_ascii_case("GET") {
        let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nConnection: close\r\n\r\n");
        return;
    }
    *shared.hits.lock().unwrap().entry(range).or_insert(0) += 1;
    let served = shared.requests.fetch_add(1, Ordering::SeqCst);
    let opts = &shared.opts;

    if let Some(status) = opts.status {
        let response = format!(
            "HTTP/1.1 {} Injected\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            status
        );
        let _ = stream.write_all(response.as_bytes());
        return;
    }
    if let (Some(fail_start), Some((start, _))) = (opts.fail_start, range) {
        let mut left = shared.failures_left.lock().unwrap();
        if start == fail_start && *left > 0 {
            if *left != usize::MAX {
                *left -= 1;
            }
            drop(left);
            let _ = stream.write_all(
                b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            );
            return;
        }
    }

    let body = match &opts.swap_body {
        Some((after, other)) if served >= *after => &other[..],
        _ => &shared.body[..],
    };
    let total = body.len() as u64;
    let claimed = if opts.misreport_total && range != Some((0, 0)) {
        total + 1
    } else {
        total
    };
    let honour = opts.support_ranges || (opts.honour_probe && range == Some((0, 0)));
    let etag = opts
        .etag
        .as_ref()
        .map(|e| format!("ETag: \"{}\"\r\n", e))
        .unwrap_or_default();
    let (status, content_range, slice) = match range {
        Some((start, end_incl)) if honour => {
            let end_incl = end_incl.min(total.saturating_sub(1));
            if total == 0 {
                ("206 Partial Content", "bytes 0-0/0".to_string(), &body[0..0])
            } else if start > end_incl {
                ("416 Range Not Satisfiable", format!("bytes */{}", total), &body[0..0])
            } else {
                (
                    "206 Partial Content",
                    format!("bytes {}-{}/{}", start, end_incl, claimed),
                    &body[start as usize..=end_incl as usize],
                )
            }
        }
        _ => ("200 OK", String::new(), body),
    };
    let content_range = if content_range.is_empty() {
        String::new()
    } else {
        format!("Content-Range: {}\r\n", content_range)
    };
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\n{}{}Connection: close\r\n\r\n",
        status,
        slice.len(),
        content_range,
        etag
    );
    if stream.write_all(response.as_bytes()).is_err() {
        return;
    }
    match opts.throttle {
        Some(pause) => {
            for piece in slice.chunks(1024) {
                if stream.write_all(piece).is_err() {
                    return;
                }
                thread::sleep(pause);
            }
        }
        None => {
            let _ = stream.write_all(slice);
        }
    }
}

/// Returns (method, optional (start, end_inclusive) for Range: bytes=X-Y).
fn parse_request(request: &str) -> (&str, RangeKey) {
    let mut method = "";
    let mut range = None;
    for line in request.lines() {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if method.is_empty() {
            method = line.split_whitespace().next().unwrap_or("");
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("range") {
                let value = value.trim();
                if value.to_lowercase().starts_with("bytes=") {
                    let part = value[6..].trim();
                    if let Some((a, b)) = part.split_once('-') {
                        let start = a.trim().parse::<u64>().unwrap_or(0);
                        let end = b.trim();
                        let end_incl = if end.is_empty() {
                            u64::MAX
                        } else {
                            end.parse::<u64>().unwrap_or(0)
                        };
                        range = Some((start, end_incl));
                    }
                }
            }
        }
    }
    (method, range)
}
