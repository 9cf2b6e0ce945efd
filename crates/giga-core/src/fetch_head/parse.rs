//! Parse HTTP response header lines (status, Content-Range, validators).

use std::str;

/// Status and headers of the final response of a transfer.
///
/// libcurl hands every header line of every response (redirects included) to
/// the header callback; a new status line starts a fresh response.
#[derive(Debug, Default, Clone)]
pub struct ResponseHead {
    pub status: Option<u32>,
    lines: Vec<String>,
}

impl ResponseHead {
    /// Feed one raw header line from libcurl's header callback.
    pub fn push_line(&mut self, data: &[u8]) {
        let Ok(line) = str::from_utf8(data) else {
            return;
        };
        let line = line.trim_end();
        if line.starts_with("HTTP/") {
            self.status = parse_status_line(line);
            self.lines.clear();
        } else if !line.is_empty() {
            self.lines.push(line.to_string());
        }
    }

    /// Value of the first header named `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| {
            let (n, v) = line.split_once(':')?;
            n.trim().eq_ignore_ascii_case(name).then(|| v.trim())
        })
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")?.parse().ok()
    }

    pub fn content_range(&self) -> Option<ContentRange> {
        parse_content_range(self.header("content-range")?)
    }

    pub fn etag(&self) -> Option<String> {
        self.header("etag").map(|v| v.trim_matches('"').to_string())
    }

    pub fn last_modified(&self) -> Option<String> {
        self.header("last-modified").map(str::to_string)
    }
}

fn parse_status_line(line: &str) -> Option<u32> {
    line.split_whitespace().nth(1)?.parse().ok()
}

/// Parsed `Content-Range: bytes first-last/total` (RFC 7233).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    /// `(first, last)` inclusive; `None` for the unsatisfied form `bytes */total`.
    pub range: Option<(u64, u64)>,
    /// `None` when the server sends `*` for an unknown total.
    pub total: Option<u64>,
}

pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range_part, total_part) = rest.split_once('/')?;
    let total = match total_part.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    let range = match range_part.trim() {
        "*" => None,
        r => {
            let (a, b) = r.split_once('-')?;
            let first: u64 = a.trim().parse().ok()?;
            let last: u64 = b.trim().parse().ok()?;
            if last < first {
                return None;
            }
            Some((first, last))
        }
    };
    Some(ContentRange { range, total })
}
