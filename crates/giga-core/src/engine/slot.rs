//! Per-mission bookkeeping held by the engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::control::AbortToken;
use crate::mission::{Mission, MissionId, MissionStatus};

/// Why a running mission was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum StopRequest {
    Pause,
    Cancel,
}

#[derive(Default)]
pub(super) struct Control {
    /// True from claim until the run task has wound down.
    pub active: bool,
    pub abort: Option<AbortToken>,
    pub stop: Option<StopRequest>,
    pub task: Option<JoinHandle<()>>,
}

pub(super) struct Slot {
    pub id: MissionId,
    mission: Mutex<Mission>,
    control: Mutex<Control>,
    /// Keeps store writes for this mission in order.
    pub write_lock: tokio::sync::Mutex<()>,
    /// Last announced status; `None` once the mission is removed.
    status_tx: watch::Sender<Option<MissionStatus>>,
    removed: AtomicBool,
}

impl Slot {
    pub fn new(mission: Mission) -> Self {
        let (status_tx, _) = watch::channel(Some(mission.status));
        Self {
            id: mission.id.clone(),
            mission: Mutex::new(mission),
            control: Mutex::new(Control::default()),
            write_lock: tokio::sync::Mutex::new(()),
            status_tx,
            removed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Mission> {
        self.mission.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> Mission {
        self.lock().clone()
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut Mission) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn status(&self) -> MissionStatus {
        self.lock().status
    }

    pub fn is_active(&self) -> bool {
        self.control().active
    }

    /// Asks the run task to stop and hands back its handle for awaiting.
    pub fn request_stop(&self, request: Option<StopRequest>) -> Option<JoinHandle<()>> {
        let mut control = self.control();
        if !control.active {
            return None;
        }
        if control.stop.is_none() {
            control.stop = request;
        }
        if let Some(abort) = &control.abort {
            abort.abort();
        }
        control.task.take()
    }

    pub fn publish(&self, status: Option<MissionStatus>) {
        self.status_tx.send_replace(status);
    }

    pub fn watch(&self) -> watch::Receiver<Option<MissionStatus>> {
        self.status_tx.subscribe()
    }

    pub fn mark_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }
}
