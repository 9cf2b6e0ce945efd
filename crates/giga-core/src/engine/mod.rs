//! The download engine: mission queue, run slots and the inbound API.
//!
//! Missions live in memory as the authoritative copy and are written through
//! to the [`MissionStore`] on every chunk completion and every status change.
//! At most `max_running_missions` run at once; the rest wait as `Pending` in
//! creation order. Each running mission gets one async task that probes,
//! opens the partial file and hands the byte work to blocking fetcher threads.

mod error;
mod run;
mod slot;

pub use error::EngineError;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, Notify};

use crate::config::EngineConfig;
use crate::control::AbortToken;
use crate::mission::{ErrorCode, Mission, MissionId, MissionStatus, TransferMode};
use crate::progress::MissionEvent;
use crate::scheduler::GlobalConnectionBudget;
use crate::segmenter::ChunkState;
use crate::storage::{FileAccessError, FileProvider, LocalFiles};
use crate::store::MissionStore;
use slot::{Slot, StopRequest};

/// Capacity of the event channel; slower subscribers skip ahead.
const EVENT_CAPACITY: usize = 1024;

/// Result of [`DownloadEngine::check_existing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissionCheck {
    /// No mission targets that destination.
    None,
    /// A mission exists and is waiting, paused or failed.
    Pending,
    Running,
    Finished,
}

pub struct EngineBuilder {
    config: EngineConfig,
    store: Arc<dyn MissionStore>,
    files: Arc<dyn FileProvider>,
    autostart: bool,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig, store: Arc<dyn MissionStore>) -> Self {
        Self {
            config,
            store,
            files: Arc::new(LocalFiles),
            autostart: true,
        }
    }

    /// Replaces the local filesystem with another capability provider.
    pub fn files(mut self, files: Arc<dyn FileProvider>) -> Self {
        self.files = files;
        self
    }

    /// When false, missions are queued but nothing runs until
    /// [`DownloadEngine::run_until_idle`] or [`DownloadEngine::set_autostart`].
    pub fn autostart(mut self, autostart: bool) -> Self {
        self.autostart = autostart;
        self
    }

    /// Loads every persisted mission and starts the queue.
    ///
    /// Unreadable store contents fail the whole open.
    pub async fn open(self) -> Result<DownloadEngine, EngineError> {
        let missions = self.store.load_all().await?;
        let mut slots = Vec::with_capacity(missions.len());
        for mut mission in missions {
            match recover(&mut mission) {
                Recovery::Keep => {}
                Recovery::Changed => self.store.update(&mission).await?,
                Recovery::Drop => {
                    tracing::info!(mission = %mission.id, path = %mission.path().display(), "finished file is gone; forgetting mission");
                    self.store.delete(&mission).await?;
                    continue;
                }
            }
            slots.push(Arc::new(Slot::new(mission)));
        }
        tracing::info!(missions = slots.len(), "engine opened");

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(Inner {
            budget: Arc::new(GlobalConnectionBudget::new(self.config.max_total_connections)),
            config: self.config,
            store: self.store,
            files: self.files,
            events,
            slots: Mutex::new(slots),
            autostart: AtomicBool::new(self.autostart),
            idle: Notify::new(),
            runtime: Handle::current(),
        });
        inner.schedule();
        Ok(DownloadEngine { inner })
    }
}

enum Recovery {
    Keep,
    Changed,
    Drop,
}

/// Normalizes a mission loaded after a restart or crash.
fn recover(m: &mut Mission) -> Recovery {
    if m.status == MissionStatus::Finished {
        return if m.path().exists() {
            Recovery::Keep
        } else {
            Recovery::Drop
        };
    }
    let mut changed = false;
    if m.status == MissionStatus::Running {
        m.status = MissionStatus::Pending;
        changed = true;
    }
    let temp_exists = m.temp_path().exists();
    let all_done = m.mode == TransferMode::Chunked
        && !m.chunks.is_empty()
        && m.chunks.iter().all(|s| *s == ChunkState::Done);
    if all_done && !temp_exists {
        // Renamed before the Finished status reached the store.
        let on_disk = std::fs::metadata(m.path()).map(|md| md.len()).ok();
        if on_disk == Some(m.length) {
            m.status = MissionStatus::Finished;
            m.error = None;
            m.touch();
            return Recovery::Changed;
        }
    }
    if m.has_progress() && !temp_exists {
        tracing::warn!(mission = %m.id, code = %ErrorCode::ProgressLost, "partial file is missing; progress reset");
        m.reset_progress();
        changed = true;
    }
    if changed {
        m.touch();
        Recovery::Changed
    } else {
        Recovery::Keep
    }
}

pub(crate) struct Inner {
    config: EngineConfig,
    store: Arc<dyn MissionStore>,
    files: Arc<dyn FileProvider>,
    budget: Arc<GlobalConnectionBudget>,
    events: broadcast::Sender<MissionEvent>,
    /// Queue order is creation order.
    slots: Mutex<Vec<Arc<Slot>>>,
    autostart: AtomicBool,
    /// Signalled whenever a run task ends.
    idle: Notify,
    /// Runtime the engine was opened on; run tasks are spawned here so the
    /// sync API works from any thread.
    runtime: Handle,
}

impl Inner {
    fn slots(&self) -> MutexGuard<'_, Vec<Arc<Slot>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self, id: &MissionId) -> Result<Arc<Slot>, EngineError> {
        self.slots()
            .iter()
            .find(|s| &s.id == id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(id.clone()))
    }

    /// Removes a slot from the queue and marks it removed, under the queue lock.
    fn detach(&self, id: &MissionId) -> Result<Arc<Slot>, EngineError> {
        let mut slots = self.slots();
        let index = slots
            .iter()
            .position(|s| &s.id == id)
            .ok_or_else(|| EngineError::NotFound(id.clone()))?;
        let slot = slots.remove(index);
        slot.mark_removed();
        Ok(slot)
    }

    /// Writes the current in-memory mission through to the store.
    async fn persist(&self, slot: &Slot) -> Result<(), EngineError> {
        let _order = slot.write_lock.lock().await;
        if slot.is_removed() {
            return Ok(());
        }
        let snapshot = slot.snapshot();
        self.store.update(&snapshot).await?;
        Ok(())
    }

    async fn persist_logged(&self, slot: &Slot) {
        if let Err(e) = self.persist(slot).await {
            tracing::error!(mission = %slot.id, "failed to persist mission: {}", e);
        }
    }

    /// Publishes the current status to subscribers and waiters.
    fn announce(&self, slot: &Slot) {
        let (status, error) = slot.with(|m| (m.status, m.error.clone()));
        slot.publish(Some(status));
        let _ = self.events.send(MissionEvent::Status {
            id: slot.id.clone(),
            status,
            error,
        });
    }

    /// Claims `Pending` missions in queue order while run slots are free.
    fn schedule(self: &Arc<Self>) {
        if !self.autostart.load(Ordering::Acquire) {
            return;
        }
        let slots = self.slots();
        let cap = self.config.max_running_missions.max(1);
        let mut active = slots.iter().filter(|s| s.is_active()).count();
        for slot in slots.iter() {
            if active >= cap {
                break;
            }
            if slot.is_removed() || slot.status() != MissionStatus::Pending || slot.is_active() {
                continue;
            }
            self.start(slot);
            active += 1;
        }
    }

    fn start(self: &Arc<Self>, slot: &Arc<Slot>) {
        if slot.is_removed() {
            return;
        }
        let abort = AbortToken::new();
        {
            let mut control = slot.control();
            control.active = true;
            control.stop = None;
            control.abort = Some(abort.clone());
        }
        if let Err((from, to)) = slot.with(|m| m.set_status(MissionStatus::Running)) {
            tracing::warn!(mission = %slot.id, %from, %to, "unexpected transition at claim");
        }
        self.announce(slot);
        let inner = Arc::clone(self);
        let task_slot = Arc::clone(slot);
        let handle = self.runtime.spawn(async move {
            run::run_mission(&inner, &task_slot, abort).await;
            {
                let mut control = task_slot.control();
                control.active = false;
                control.abort = None;
                control.stop = None;
            }
            inner.idle.notify_waiters();
            inner.schedule();
        });
        slot.control().task = Some(handle);
    }

    /// Stops a running mission and waits for its task to wind down.
    async fn stop(&self, slot: &Slot, request: Option<StopRequest>) {
        if let Some(task) = slot.request_stop(request) {
            let _ = task.await;
        }
        while slot.is_active() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn is_idle(&self) -> bool {
        self.slots()
            .iter()
            .all(|s| !s.is_active() && s.status() != MissionStatus::Pending)
    }
}

/// Handle to a running engine. Cheap to clone.
#[derive(Clone)]
pub struct DownloadEngine {
    inner: Arc<Inner>,
}

impl DownloadEngine {
    /// Creates and enqueues a mission for `location/name`.
    ///
    /// An empty `name` is derived from the first URL. `block_size` defaults
    /// to the configured chunk size.
    pub async fn create_mission(
        &self,
        urls: Vec<String>,
        location: impl Into<PathBuf>,
        name: impl Into<String>,
        block_size: Option<u64>,
    ) -> Result<Mission, EngineError> {
        if urls.is_empty() {
            return Err(EngineError::NoUrls);
        }
        for raw in &urls {
            validate_url(raw)?;
        }
        let location = location.into();
        let mut name = name.into();
        if name.trim().is_empty() {
            name = crate::mission::name_from_url(&urls[0])
                .ok_or_else(|| EngineError::InvalidName(String::new()))?;
        }
        validate_name(&name)?;

        let mission = Mission::new(
            urls,
            location,
            name,
            block_size.unwrap_or(self.inner.config.block_size),
        );
        if self.check_existing(&mission.location, &mission.name) != MissionCheck::None {
            return Err(EngineError::Duplicate(mission.path()));
        }
        self.inner
            .files
            .prepare_location(&mission.location)
            .map_err(|e| match e {
                FileAccessError::Denied(_) => {
                    EngineError::WritePermissionDenied(mission.location.clone())
                }
                FileAccessError::Missing => EngineError::Storage {
                    path: mission.location.clone(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                },
                FileAccessError::Io(source) => EngineError::Storage {
                    path: mission.location.clone(),
                    source,
                },
            })?;
        self.inner
            .store
            .add(&mission)
            .await
            .map_err(EngineError::from_store)?;

        tracing::info!(mission = %mission.id, path = %mission.path().display(), urls = mission.urls.len(), "mission created");
        let slot = Arc::new(Slot::new(mission.clone()));
        self.inner.slots().push(Arc::clone(&slot));
        self.inner.announce(&slot);
        self.inner.schedule();
        Ok(mission)
    }

    /// Pauses a pending or running mission. Running fetchers stop at their
    /// next I/O checkpoint; this returns once they have. No-op otherwise.
    pub async fn pause(&self, id: &MissionId) -> Result<(), EngineError> {
        let slot = self.inner.slot(id)?;
        if slot.is_active() {
            self.inner.stop(&slot, Some(StopRequest::Pause)).await;
            return Ok(());
        }
        let paused = slot.with(|m| {
            m.status == MissionStatus::Pending && m.set_status(MissionStatus::Paused).is_ok()
        });
        if paused {
            tracing::info!(mission = %id, "mission paused");
            self.inner.persist(&slot).await?;
            self.inner.announce(&slot);
        }
        Ok(())
    }

    /// Re-queues a paused mission. No-op for pending, running or finished
    /// missions; a failed mission needs [`retry`](Self::retry).
    pub async fn resume(&self, id: &MissionId) -> Result<(), EngineError> {
        let slot = self.inner.slot(id)?;
        match slot.status() {
            MissionStatus::Paused => {}
            MissionStatus::Error => {
                return Err(EngineError::InvalidTransition {
                    action: "resume",
                    status: MissionStatus::Error,
                })
            }
            _ => return Ok(()),
        }
        if slot.is_active() {
            // Still winding down from the pause.
            self.inner.stop(&slot, None).await;
        }
        slot.with(|m| m.set_status(MissionStatus::Pending))
            .map_err(|(from, _)| EngineError::InvalidTransition {
                action: "resume",
                status: from,
            })?;
        tracing::info!(mission = %id, "mission resumed");
        self.inner.persist(&slot).await?;
        self.inner.announce(&slot);
        self.inner.schedule();
        Ok(())
    }

    /// Re-queues a failed mission: `Failed` chunks go back to `Pending`,
    /// `Done` chunks are kept.
    pub async fn retry(&self, id: &MissionId) -> Result<(), EngineError> {
        let slot = self.inner.slot(id)?;
        slot.with(|m| {
            if m.status != MissionStatus::Error {
                return Err(EngineError::InvalidTransition {
                    action: "retry",
                    status: m.status,
                });
            }
            m.reset_failed_chunks();
            m.set_status(MissionStatus::Pending)
                .map_err(|(from, _)| EngineError::InvalidTransition {
                    action: "retry",
                    status: from,
                })
        })?;
        tracing::info!(mission = %id, "mission retried");
        self.inner.persist(&slot).await?;
        self.inner.announce(&slot);
        self.inner.schedule();
        Ok(())
    }

    /// Stops the mission if needed and deletes its record. With
    /// `remove_file` the partial file (and a finished download) is deleted too.
    pub async fn cancel(&self, id: &MissionId, remove_file: bool) -> Result<(), EngineError> {
        // Out of the queue before anything can claim it again.
        let slot = self.inner.detach(id)?;
        self.inner.stop(&slot, Some(StopRequest::Cancel)).await;
        let mission = slot.snapshot();
        {
            let _order = slot.write_lock.lock().await;
            self.inner.store.delete(&mission).await?;
        }
        if remove_file {
            let mut paths = vec![mission.temp_path()];
            if mission.status == MissionStatus::Finished {
                paths.push(mission.path());
            }
            for path in paths {
                self.inner
                    .files
                    .remove(&path)
                    .map_err(|source| EngineError::Storage { path, source })?;
            }
        }
        tracing::info!(mission = %id, remove_file, "mission cancelled");
        slot.publish(None);
        let _ = self
            .inner
            .events
            .send(MissionEvent::Removed { id: id.clone() });
        self.inner.schedule();
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MissionEvent> {
        self.inner.events.subscribe()
    }

    /// Snapshot of every mission in queue order.
    pub fn missions(&self) -> Vec<Mission> {
        self.inner.slots().iter().map(|s| s.snapshot()).collect()
    }

    pub fn mission(&self, id: &MissionId) -> Option<Mission> {
        self.inner.slot(id).ok().map(|s| s.snapshot())
    }

    /// Waits until the mission is neither pending nor running and returns
    /// that status. Never returns for a pending mission while autostart is off.
    pub async fn wait(&self, id: &MissionId) -> Result<MissionStatus, EngineError> {
        let slot = self.inner.slot(id)?;
        let mut rx = slot.watch();
        let settled = rx
            .wait_for(|s| !matches!(s, Some(MissionStatus::Pending | MissionStatus::Running)))
            .await
            .map(|s| *s)
            .unwrap_or(None);
        settled.ok_or_else(|| EngineError::NotFound(id.clone()))
    }

    /// Whether a mission already targets `location/name`.
    pub fn check_existing(&self, location: &Path, name: &str) -> MissionCheck {
        let slots = self.inner.slots();
        let Some(slot) = slots.iter().find(|s| {
            s.with(|m| m.location.as_path() == location && m.name == name)
        }) else {
            return MissionCheck::None;
        };
        match slot.status() {
            MissionStatus::Running => MissionCheck::Running,
            MissionStatus::Finished => MissionCheck::Finished,
            _ => MissionCheck::Pending,
        }
    }

    pub async fn pause_all(&self) -> Result<(), EngineError> {
        for id in self.ids() {
            self.pause(&id).await?;
        }
        Ok(())
    }

    /// Re-queues every paused mission.
    pub async fn start_all(&self) -> Result<(), EngineError> {
        for mission in self.missions() {
            if mission.status == MissionStatus::Paused {
                self.resume(&mission.id).await?;
            }
        }
        Ok(())
    }

    /// Drops the records of finished missions; their files stay.
    pub async fn forget_finished(&self) -> Result<usize, EngineError> {
        let mut forgotten = 0;
        for mission in self.missions() {
            if mission.status == MissionStatus::Finished {
                self.cancel(&mission.id, false).await?;
                forgotten += 1;
            }
        }
        Ok(forgotten)
    }

    /// Turns queue claiming on or off. Safe to call from threads outside
    /// the runtime the engine was opened on.
    pub fn set_autostart(&self, autostart: bool) {
        self.inner.autostart.store(autostart, Ordering::Release);
        self.inner.schedule();
    }

    /// Enables autostart and returns once no mission is pending or running.
    pub async fn run_until_idle(&self) {
        self.set_autostart(true);
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.is_idle() {
                return;
            }
            let _ = tokio::time::timeout(Duration::from_millis(250), notified).await;
        }
    }

    /// Stops every running mission without pausing it; they load as
    /// `Pending` next time.
    pub async fn shutdown(&self) {
        self.inner.autostart.store(false, Ordering::Release);
        let slots: Vec<_> = self.inner.slots().clone();
        for slot in slots {
            self.inner.stop(&slot, None).await;
        }
    }

    fn ids(&self) -> Vec<MissionId> {
        self.inner.slots().iter().map(|s| s.id.clone()).collect()
    }
}

fn validate_url(raw: &str) -> Result<(), EngineError> {
    let invalid = |reason: String| EngineError::InvalidUrl {
        url: raw.to_string(),
        reason,
    };
    let parsed = url::Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(invalid(format!("unsupported scheme {:?}", other))),
    }
    if parsed.host_str().is_none() {
        return Err(invalid("missing host".to_string()));
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<(), EngineError> {
    if name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(EngineError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests;
