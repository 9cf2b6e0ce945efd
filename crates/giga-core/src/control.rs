//! Abort tokens for pause/cancel and the control socket location.
//!
//! Each running mission holds one `AbortToken`. Fetchers poll it after every
//! buffer and from the libcurl progress callback; backoff sleeps wake early
//! when it trips.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Granularity of interruptible sleeps.
const SLEEP_SLICE: Duration = Duration::from_millis(25);

/// Shared stop flag for one mission run.
///
/// A child token trips with its parent but can also be tripped on its own,
/// which lets a worker pool stop itself without pausing the mission.
#[derive(Debug, Clone, Default)]
pub struct AbortToken(Arc<TokenState>);

#[derive(Debug, Default)]
struct TokenState {
    flag: AtomicBool,
    parent: Option<AbortToken>,
}

impl AbortToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child(&self) -> Self {
        AbortToken(Arc::new(TokenState {
            flag: AtomicBool::new(false),
            parent: Some(self.clone()),
        }))
    }

    pub fn abort(&self) {
        self.0.flag.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.flag.load(Ordering::Acquire)
            || self.0.parent.as_ref().is_some_and(|p| p.is_aborted())
    }
}

/// Sleeps for `total` unless `halted` turns true first. Returns false if interrupted.
pub fn sleep_unless(total: Duration, halted: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if halted() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

/// Default path for the control socket (same XDG state dir as the database).
pub fn default_control_socket_path() -> std::io::Result<PathBuf> {
    let dirs = xdg::BaseDirectories::with_prefix("giga").map_err(std::io::Error::other)?;
    dirs.place_state_file("control.sock")
}
