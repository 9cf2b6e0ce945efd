//! Range gate: holds back every fetcher but one until the server has shown
//! it honours `Range`.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    /// No fetcher has been let through yet.
    Untested,
    /// One fetcher is waiting for its first response.
    Testing,
    /// A `206` with the right `Content-Range` came back.
    Open,
    /// Ranges are ignored, or the run is stopping.
    Closed,
}

pub struct RangeGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl Default for RangeGate {
    fn default() -> Self {
        Self::new()
    }
}

impl RangeGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState::Untested),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Blocks until this fetcher may claim a chunk. The first caller passes at
    /// once and becomes the tester. Returns false if the gate closed or
    /// `halted()` turned true while waiting.
    pub fn enter(&self, halted: impl Fn() -> bool) -> bool {
        let mut state = self.lock();
        loop {
            match *state {
                GateState::Open => return true,
                GateState::Closed => return false,
                GateState::Untested => {
                    *state = GateState::Testing;
                    return true;
                }
                GateState::Testing => {
                    if halted() {
                        return false;
                    }
                    state = self
                        .changed
                        .wait_timeout(state, Duration::from_millis(50))
                        .map(|(g, _)| g)
                        .unwrap_or_else(|e| e.into_inner().0);
                }
            }
        }
    }

    /// Ranges confirmed; release the waiting fetchers.
    pub fn open(&self) {
        let mut state = self.lock();
        if *state != GateState::Closed {
            *state = GateState::Open;
        }
        self.changed.notify_all();
    }

    /// Stop letting fetchers through.
    pub fn close(&self) {
        *self.lock() = GateState::Closed;
        self.changed.notify_all();
    }
}
