//! Error codes and failure classes recorded on missions that end in `Error`.

use std::fmt;

/// Broad class of a mission failure; decides whether the engine retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Timeouts, resets, DNS hiccups, 5xx. Retried with backoff.
    NetworkTransient,
    /// 4xx, malformed URL, TLS failure. Fails the mission at once.
    NetworkPermanent,
    /// Disk full, permission denied, path invalid. Never retried.
    StorageFailure,
    /// Server ignored `Range` or changed the resource length.
    ProtocolMismatch,
}

/// Numeric error code persisted with a failed mission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// HTTP status other than the ones with dedicated codes.
    Http(u16),
    /// 204, or a resource of length zero.
    NoContent,
    PathCreation,
    FileCreation,
    Unknown,
    PermissionDenied,
    Ssl,
    UnknownHost,
    ConnectHost,
    InsufficientStorage,
    ProgressLost,
    Timeout,
    ResourceGone,
    WriteFailed,
    ProtocolMismatch,
    InvalidUrl,
}

impl ErrorCode {
    pub fn code(self) -> i64 {
        match self {
            ErrorCode::Http(status) => i64::from(status),
            ErrorCode::NoContent => 204,
            ErrorCode::PathCreation => 1000,
            ErrorCode::FileCreation => 1001,
            ErrorCode::Unknown => 1002,
            ErrorCode::PermissionDenied => 1003,
            ErrorCode::Ssl => 1004,
            ErrorCode::UnknownHost => 1005,
            ErrorCode::ConnectHost => 1006,
            ErrorCode::InsufficientStorage => 1010,
            ErrorCode::ProgressLost => 1011,
            ErrorCode::Timeout => 1012,
            ErrorCode::ResourceGone => 1013,
            ErrorCode::WriteFailed => 1020,
            ErrorCode::ProtocolMismatch => 1021,
            ErrorCode::InvalidUrl => 1022,
        }
    }

    /// Inverse of [`ErrorCode::code`]. Codes below 1000 are HTTP statuses.
    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            204 => ErrorCode::NoContent,
            100..=999 => ErrorCode::Http(code as u16),
            1000 => ErrorCode::PathCreation,
            1001 => ErrorCode::FileCreation,
            1002 => ErrorCode::Unknown,
            1003 => ErrorCode::PermissionDenied,
            1004 => ErrorCode::Ssl,
            1005 => ErrorCode::UnknownHost,
            1006 => ErrorCode::ConnectHost,
            1010 => ErrorCode::InsufficientStorage,
            1011 => ErrorCode::ProgressLost,
            1012 => ErrorCode::Timeout,
            1013 => ErrorCode::ResourceGone,
            1020 => ErrorCode::WriteFailed,
            1021 => ErrorCode::ProtocolMismatch,
            1022 => ErrorCode::InvalidUrl,
            _ => return None,
        })
    }

    pub fn class(self) -> FailureClass {
        match self {
            ErrorCode::Http(s) if s == 429 || (500..600).contains(&s) => {
                FailureClass::NetworkTransient
            }
            ErrorCode::UnknownHost | ErrorCode::ConnectHost | ErrorCode::Timeout => {
                FailureClass::NetworkTransient
            }
            ErrorCode::Http(_)
            | ErrorCode::NoContent
            | ErrorCode::Ssl
            | ErrorCode::ResourceGone
            | ErrorCode::InvalidUrl
            | ErrorCode::Unknown => FailureClass::NetworkPermanent,
            ErrorCode::PathCreation
            | ErrorCode::FileCreation
            | ErrorCode::PermissionDenied
            | ErrorCode::InsufficientStorage
            | ErrorCode::ProgressLost
            | ErrorCode::WriteFailed => FailureClass::StorageFailure,
            ErrorCode::ProtocolMismatch => FailureClass::ProtocolMismatch,
        }
    }

    /// Maps an I/O error on the destination file to a storage code.
    pub fn from_io(e: &std::io::Error) -> Self {
        #[cfg(unix)]
        {
            if e.raw_os_error() == Some(libc::ENOSPC) {
                return ErrorCode::InsufficientStorage;
            }
        }
        match e.kind() {
            std::io::ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
            std::io::ErrorKind::NotFound => ErrorCode::PathCreation,
            _ => ErrorCode::WriteFailed,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Http(s) => write!(f, "HTTP {}", s),
            other => write!(f, "{:?} ({})", other, other.code()),
        }
    }
}

/// Cause recorded on a mission in `Error`; survives restarts via the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissionFailure {
    pub code: ErrorCode,
    pub message: String,
}

impl MissionFailure {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn class(&self) -> FailureClass {
        self.code.class()
    }
}

impl fmt::Display for MissionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}
