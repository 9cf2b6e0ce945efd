//! Retry loop: run a transfer until success, walking the mirror list.

use super::classify;
use super::error::ChunkError;
use super::policy::{RetryDecision, RetryPolicy};
use crate::control::sleep_unless;

/// Runs `attempt_fn` against each URL in order until one succeeds.
///
/// Each URL gets `policy.max_attempts` tries with backoff between them; the
/// next mirror starts with a fresh budget. Non-retryable errors return at once.
/// `on_failure(err, attempt)` runs after every failed try. Returns
/// `ChunkError::Aborted` as soon as `halted()` is true, including mid-backoff.
pub fn run_with_retry<T, F, H, N>(
    policy: &RetryPolicy,
    urls: &[String],
    halted: H,
    mut on_failure: N,
    mut attempt_fn: F,
) -> Result<T, ChunkError>
where
    F: FnMut(&str) -> Result<T, ChunkError>,
    H: Fn() -> bool,
    N: FnMut(&ChunkError, u32),
{
    let mut last_error = None;
    for (mirror, url) in urls.iter().enumerate() {
        let mut attempt = 1u32;
        loop {
            if halted() {
                return Err(ChunkError::Aborted);
            }
            let err = match attempt_fn(url) {
                Ok(v) => return Ok(v),
                Err(ChunkError::Aborted) => return Err(ChunkError::Aborted),
                Err(e) => e,
            };
            on_failure(&err, attempt);
            let kind = classify::classify(&err);
            if !kind.is_retryable() {
                return Err(err);
            }
            match policy.decide(attempt, kind) {
                RetryDecision::NoRetry => {
                    if mirror + 1 < urls.len() {
                        tracing::warn!(url = %url, attempts = attempt, "giving up on url, trying next mirror: {}", err);
                    }
                    last_error = Some(err);
                    break;
                }
                RetryDecision::RetryAfter(d) => {
                    tracing::debug!(url = %url, attempt, delay_ms = d.as_millis() as u64, "retrying after: {}", err);
                    if !sleep_unless(d, &halted) {
                        return Err(ChunkError::Aborted);
                    }
                    attempt += 1;
                }
            }
        }
    }
    Err(last_error.unwrap_or(ChunkError::Aborted))
}
