//! Range fetchers.
//!
//! `fetch_chunk` runs one ranged GET for one chunk and writes the body at
//! the chunk's offset; `fetch_stream` runs the unpartitioned fallback GET.
//! Both are blocking (libcurl easy handles) and run on worker threads.

mod chunk;
mod gate;
mod stream;

pub use chunk::{fetch_chunk, ChunkFetch};
pub use gate::RangeGate;
pub use stream::{fetch_stream, StreamFetch};

use std::time::Duration;

/// libcurl settings shared by the probe and every fetcher.
#[derive(Debug, Clone)]
pub struct CurlOptions {
    pub connect_timeout: Duration,
    /// Fail a transfer that moves no bytes for this long.
    pub stall_timeout: Duration,
    pub buffer_size: usize,
    pub user_agent: String,
}

impl Default for CurlOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            stall_timeout: Duration::from_secs(30),
            buffer_size: 64 * 1024,
            user_agent: format!("giga/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl CurlOptions {
    /// New easy handle for `url` with redirects, timeouts and buffer size applied.
    pub fn easy(&self, url: &str) -> Result<curl::easy::Easy, curl::Error> {
        let mut easy = curl::easy::Easy::new();
        easy.url(url)?;
        easy.follow_location(true)?;
        easy.max_redirections(10)?;
        easy.connect_timeout(self.connect_timeout)?;
        // Less than 1 byte/s for the whole window counts as a stall.
        easy.low_speed_limit(1)?;
        easy.low_speed_time(self.stall_timeout)?;
        easy.buffer_size(self.buffer_size)?;
        easy.useragent(&self.user_agent)?;
        Ok(easy)
    }
}
