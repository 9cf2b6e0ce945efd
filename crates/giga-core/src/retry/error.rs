//! Chunk transfer error type for retry classification.

use std::fmt;

use crate::mission::{ErrorCode, MissionFailure};

/// Error returned by one ranged or streamed transfer.
/// Kept concrete so it can be classified before it becomes a mission failure.
#[derive(Debug)]
pub enum ChunkError {
    /// Curl reported an error (timeout, connection, TLS, etc.).
    Curl(curl::Error),
    /// HTTP response had a non-2xx status.
    Http(u32),
    /// Transfer completed but fewer bytes arrived than the range asked for.
    PartialTransfer { expected: u64, received: u64 },
    /// Writing to the destination failed (disk full, permission denied). Not retried.
    Storage(std::io::Error),
    /// Server answered a ranged request with `200` and the full body.
    RangeIgnored,
    /// `206` whose `Content-Range` does not match the requested range.
    RangeMismatch { requested: String, got: Option<String> },
    /// Server reports a total length different from the probed one.
    LengthChanged { expected: u64, reported: u64 },
    /// Pause or cancel observed at an I/O checkpoint.
    Aborted,
}

impl ChunkError {
    /// Maps the error to the code and message recorded on a failed mission.
    pub fn to_failure(&self) -> MissionFailure {
        let code = match self {
            ChunkError::Curl(e) => curl_code(e),
            ChunkError::Http(204) => ErrorCode::NoContent,
            ChunkError::Http(410) => ErrorCode::ResourceGone,
            ChunkError::Http(s) => ErrorCode::Http(*s as u16),
            ChunkError::PartialTransfer { .. } => ErrorCode::ConnectHost,
            ChunkError::Storage(e) => ErrorCode::from_io(e),
            ChunkError::RangeIgnored
            | ChunkError::RangeMismatch { .. }
            | ChunkError::LengthChanged { .. } => ErrorCode::ProtocolMismatch,
            ChunkError::Aborted => ErrorCode::Unknown,
        };
        MissionFailure::new(code, self.to_string())
    }
}

fn curl_code(e: &curl::Error) -> ErrorCode {
    if e.is_operation_timedout() {
        ErrorCode::Timeout
    } else if e.is_couldnt_resolve_host() || e.is_couldnt_resolve_proxy() {
        ErrorCode::UnknownHost
    } else if e.is_couldnt_connect() {
        ErrorCode::ConnectHost
    } else if e.is_ssl_connect_error()
        || e.is_peer_failed_verification()
        || e.is_ssl_certproblem()
        || e.is_ssl_cacert()
    {
        ErrorCode::Ssl
    } else if e.is_url_malformed() || e.is_unsupported_protocol() {
        ErrorCode::InvalidUrl
    } else {
        ErrorCode::Unknown
    }
}

impl fmt::Display for ChunkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkError::Curl(e) => write!(f, "{}", e),
            ChunkError::Http(code) => write!(f, "HTTP {}", code),
            ChunkError::PartialTransfer { expected, received } => {
                write!(f, "partial transfer: expected {} bytes, got {}", expected, received)
            }
            ChunkError::Storage(e) => write!(f, "storage: {}", e),
            ChunkError::RangeIgnored => write!(f, "server ignored the Range header"),
            ChunkError::RangeMismatch { requested, got } => write!(
                f,
                "asked for bytes {}, got Content-Range {}",
                requested,
                got.as_deref().unwrap_or("(none)")
            ),
            ChunkError::LengthChanged { expected, reported } => write!(
                f,
                "resource length changed from {} to {} bytes",
                expected, reported
            ),
            ChunkError::Aborted => write!(f, "transfer aborted"),
        }
    }
}

impl std::error::Error for ChunkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChunkError::Curl(e) => Some(e),
            ChunkError::Storage(e) => Some(e),
            _ => None,
        }
    }
}
