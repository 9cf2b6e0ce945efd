//! Retry and backoff policy.
//!
//! This module encapsulates error classification (timeouts, throttling,
//! connection failures, short reads) and exponential backoff decisions so
//! that the probe and the chunk fetchers share a consistent policy, including
//! the fall-through to mirror URLs once one URL exhausts its attempts.

mod classify;
mod error;
mod policy;
mod run;

pub use classify::{classify, classify_curl_error, classify_http_status};
pub use error::ChunkError;
pub use policy::{ErrorKind, RetryDecision, RetryPolicy};
pub use run::run_with_retry;
