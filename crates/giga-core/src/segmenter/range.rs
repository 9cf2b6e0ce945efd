//! Chunk type and range planning.

/// A single chunk: byte range [start, end) (half-open).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Start offset (inclusive).
    pub start: u64,
    /// End offset (exclusive).
    pub end: u64,
}

impl Chunk {
    /// Length of this chunk in bytes.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Range in the form libcurl expects (`start-last`, inclusive end).
    pub fn curl_range(&self) -> String {
        if self.is_empty() {
            format!("{}-{}", self.start, self.start)
        } else {
            format!("{}-{}", self.start, self.end - 1)
        }
    }
}

/// Splits `length` bytes into chunks of `block_size`; the last chunk may be shorter.
///
/// Returns an empty vec if `length` or `block_size` is 0.
pub fn plan_chunks(length: u64, block_size: u64) -> Vec<Chunk> {
    if length == 0 || block_size == 0 {
        return Vec::new();
    }

    let count = length.div_ceil(block_size);
    let mut out = Vec::with_capacity(count as usize);
    let mut offset = 0u64;
    while offset < length {
        let end = offset.saturating_add(block_size).min(length);
        out.push(Chunk { start: offset, end });
        offset = end;
    }
    out
}
