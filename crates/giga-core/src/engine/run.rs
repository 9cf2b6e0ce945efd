//! One run of one mission: probe, open the partial file, fetch, finalize.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::slot::{Slot, StopRequest};
use super::Inner;
use crate::control::AbortToken;
use crate::downloader::{fetch_stream, StreamFetch};
use crate::fetch_head;
use crate::mission::{ChunkTable, ErrorCode, MissionFailure, MissionStatus, TransferMode};
use crate::progress::{spawn_reporter, BytesSource, MissionEvent, ProgressUpdate, ReporterConfig};
use crate::retry::{run_with_retry, ChunkError};
use crate::scheduler::{run_chunks, BudgetLease, ChunkJob, FailureHook, RunOutcome};
use crate::segmenter::ChunkState;
use crate::storage::{FileAccessError, OpenMode, StorageWriter, StorageWriterBuilder};

/// How `drive` ended without an error.
enum RunEnd {
    Finished,
    Stopped,
}

/// Result of one transfer attempt inside `drive`.
enum Step {
    Done(StorageWriter),
    Stopped,
    /// Mode changed (ranges ignored); probe and start over.
    Restart,
    LengthChanged(u64),
}

pub(super) async fn run_mission(inner: &Arc<Inner>, slot: &Arc<Slot>, abort: AbortToken) {
    tracing::info!(mission = %slot.id, "mission started");
    inner.persist_logged(slot).await;

    match drive(inner, slot, &abort).await {
        Ok(RunEnd::Finished) => {
            tracing::info!(mission = %slot.id, "mission finished");
        }
        Ok(RunEnd::Stopped) => {
            let request = slot.control().stop;
            let to = match request {
                Some(StopRequest::Cancel) => {
                    tracing::debug!(mission = %slot.id, "run stopped for cancel");
                    return;
                }
                Some(StopRequest::Pause) => MissionStatus::Paused,
                None => MissionStatus::Pending,
            };
            if let Err((from, to)) = slot.with(|m| m.set_status(to)) {
                tracing::warn!(mission = %slot.id, %from, %to, "unexpected transition after stop");
            }
            tracing::info!(mission = %slot.id, status = %to, "mission stopped");
            inner.persist_logged(slot).await;
            inner.announce(slot);
        }
        Err(failure) => {
            tracing::warn!(mission = %slot.id, class = ?failure.class(), "mission failed: {}", failure);
            slot.with(|m| m.fail(failure));
            inner.persist_logged(slot).await;
            inner.announce(slot);
        }
    }
}

/// Runs `f` on the blocking pool; a panic becomes a mission failure.
async fn blocking<T, F>(f: F) -> Result<T, MissionFailure>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| MissionFailure::new(ErrorCode::Unknown, format!("worker panicked: {}", e)))
}

/// Waits until the global budget grants at least one of `wanted` slots.
/// `None` if the run was stopped while waiting.
async fn reserve_connections(
    inner: &Inner,
    wanted: usize,
    abort: &AbortToken,
) -> Option<BudgetLease> {
    loop {
        let lease = BudgetLease::reserve(&inner.budget, wanted);
        if lease.slots() > 0 {
            return Some(lease);
        }
        drop(lease);
        if abort.is_aborted() {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn drive(
    inner: &Arc<Inner>,
    slot: &Arc<Slot>,
    abort: &AbortToken,
) -> Result<RunEnd, MissionFailure> {
    let cfg = &inner.config;
    let mut length_changes = 0u32;
    loop {
        if abort.is_aborted() {
            return Ok(RunEnd::Stopped);
        }

        // The probe is a connection too.
        let Some(probe_lease) = reserve_connections(inner, 1, abort).await else {
            return Ok(RunEnd::Stopped);
        };
        let urls = slot.with(|m| m.urls.clone());
        let (curl, policy, halt) = (cfg.curl_options(), cfg.retry_policy(), abort.clone());
        let probed =
            blocking(move || fetch_head::probe(&urls, &curl, &policy, || halt.is_aborted()))
                .await?;
        drop(probe_lease);
        let probe = match probed {
            Ok(p) => p,
            Err(ChunkError::Aborted) => return Ok(RunEnd::Stopped),
            Err(e) => return Err(e.to_failure()),
        };
        if probe.length == Some(0) {
            return Err(MissionFailure::new(
                ErrorCode::NoContent,
                "resource is empty",
            ));
        }
        let connections = cfg.connections_per_mission.max(1);
        slot.with(|m| {
            if m.mode == TransferMode::Unprobed {
                m.adopt_probe(&probe, connections);
                tracing::debug!(mission = %m.id, length = m.length, mode = m.mode.as_str(), chunks = m.chunks.len(), "probe adopted");
            } else if !m.matches_remote(&probe) {
                tracing::warn!(mission = %m.id, "remote resource changed since last run; discarding progress");
                m.forget_probe();
                m.adopt_probe(&probe, connections);
            }
        });
        inner.persist_logged(slot).await;

        let storage = open_storage(inner, slot)?;

        let wanted = match slot.with(|m| m.mode) {
            TransferMode::Chunked => connections,
            _ => 1,
        };
        let Some(lease) = reserve_connections(inner, wanted, abort).await else {
            return Ok(RunEnd::Stopped);
        };

        let step = match slot.with(|m| m.mode) {
            TransferMode::Chunked => run_chunked(inner, slot, abort, storage, lease.slots()).await?,
            TransferMode::Stream { resumable } => {
                run_stream(inner, slot, abort, storage, resumable).await?
            }
            TransferMode::Unprobed => {
                return Err(MissionFailure::new(
                    ErrorCode::Unknown,
                    "mission has no transfer mode",
                ))
            }
        };
        drop(lease);

        match step {
            Step::Done(storage) => {
                finalize(inner, slot, storage).await?;
                return Ok(RunEnd::Finished);
            }
            Step::Stopped => return Ok(RunEnd::Stopped),
            Step::Restart => continue,
            Step::LengthChanged(reported) => {
                length_changes += 1;
                if length_changes > 1 {
                    return Err(MissionFailure::new(
                        ErrorCode::ResourceGone,
                        format!("resource length changed again (now {} bytes)", reported),
                    ));
                }
                tracing::warn!(mission = %slot.id, reported, "resource length changed; restarting from zero");
                slot.with(|m| m.forget_probe());
                inner.persist_logged(slot).await;
            }
        }
    }
}

fn access_failure(e: FileAccessError) -> MissionFailure {
    MissionFailure::new(e.code(), e.to_string())
}

/// Opens the partial file: the existing one when there is progress to keep,
/// otherwise a fresh, preallocated one.
fn open_storage(inner: &Inner, slot: &Slot) -> Result<StorageWriter, MissionFailure> {
    let m = slot.snapshot();
    let temp = m.temp_path();
    inner
        .files
        .prepare_location(&m.location)
        .map_err(access_failure)?;
    if m.has_progress() {
        match inner.files.open(&temp, OpenMode::Existing) {
            Ok(file) => return Ok(StorageWriterBuilder::new(file, &temp).build()),
            Err(FileAccessError::Missing) => {
                tracing::warn!(mission = %m.id, code = %ErrorCode::ProgressLost, "partial file is missing; restarting from zero");
                slot.with(|m| m.reset_progress());
            }
            Err(e) => return Err(access_failure(e)),
        }
    }
    let file = inner
        .files
        .open(&temp, OpenMode::Create)
        .map_err(access_failure)?;
    let mut builder = StorageWriterBuilder::new(file, &temp);
    if m.length > 0 {
        builder
            .preallocate(m.length)
            .map_err(|e| MissionFailure::new(ErrorCode::from_io(&e), e.to_string()))?;
    }
    Ok(builder.build())
}

fn storage_failure(e: io::Error) -> MissionFailure {
    MissionFailure::new(ErrorCode::from_io(&e), e.to_string())
}

fn failure_hook(inner: &Inner, slot: &Slot) -> FailureHook {
    let events = inner.events.clone();
    let id = slot.id.clone();
    Arc::new(move |chunk: usize, attempt: u32, err: &ChunkError| {
        tracing::debug!(mission = %id, chunk, attempt, "attempt failed: {}", err);
        let _ = events.send(MissionEvent::ChunkFailed {
            id: id.clone(),
            chunk,
            attempt,
            message: err.to_string(),
        });
    })
}

fn reporter_config(inner: &Inner, slot: &Slot) -> ReporterConfig {
    ReporterConfig {
        mission_id: slot.id.clone(),
        total: slot.with(|m| m.length),
        cadence: inner.config.progress_cadence,
        interval: inner.config.progress_interval(),
    }
}

async fn run_chunked(
    inner: &Arc<Inner>,
    slot: &Arc<Slot>,
    abort: &AbortToken,
    storage: StorageWriter,
    workers: usize,
) -> Result<Step, MissionFailure> {
    let m = slot.snapshot();
    let table = Arc::new(ChunkTable::new(m.plan(), &m.chunks));
    tracing::debug!(mission = %m.id, remaining = table.remaining(), workers, "starting chunk fetchers");

    let (state_tx, mut state_rx) = mpsc::unbounded_channel::<Vec<ChunkState>>();
    let (tick_tx, tick_rx) = mpsc::unbounded_channel::<()>();
    let source: BytesSource = {
        let table = Arc::clone(&table);
        Arc::new(move || table.bytes_done())
    };
    let reporter = spawn_reporter(
        reporter_config(inner, slot),
        source,
        tick_rx,
        inner.events.clone(),
    );
    // Single writer for this mission's chunk states.
    let persister = {
        let inner = Arc::clone(inner);
        let slot = Arc::clone(slot);
        tokio::spawn(async move {
            while let Some(mut states) = state_rx.recv().await {
                while let Ok(newer) = state_rx.try_recv() {
                    states = newer;
                }
                slot.with(|m| {
                    m.chunks = states;
                    m.touch();
                });
                inner.persist_logged(&slot).await;
            }
        })
    };

    let job = ChunkJob {
        urls: Arc::new(m.urls.clone()),
        table: Arc::clone(&table),
        total: m.length,
        storage: storage.clone(),
        workers,
        policy: inner.config.retry_policy(),
        curl: inner.config.curl_options(),
        abort: abort.child(),
        on_failure: failure_hook(inner, slot),
    };
    let pool_table = Arc::clone(&table);
    let outcome = blocking(move || {
        run_chunks(job, |_| {
            let _ = state_tx.send(pool_table.snapshot());
            let _ = tick_tx.send(());
        })
    })
    .await;
    let _ = persister.await;
    let _ = reporter.await;

    slot.with(|m| {
        m.chunks = table
            .snapshot()
            .into_iter()
            .map(|s| match s {
                ChunkState::InProgress => ChunkState::Pending,
                other => other,
            })
            .collect();
        m.touch();
    });
    inner.persist_logged(slot).await;

    match outcome? {
        RunOutcome::Completed => Ok(Step::Done(storage)),
        RunOutcome::Aborted => Ok(Step::Stopped),
        RunOutcome::Failed { index, error } => {
            let failure = error.to_failure();
            Err(MissionFailure::new(
                failure.code,
                format!("chunk {}: {}", index, failure.message),
            ))
        }
        RunOutcome::RangeIgnored => {
            tracing::warn!(mission = %slot.id, "server ignored Range; falling back to a single stream");
            storage.truncate().map_err(storage_failure)?;
            slot.with(|m| m.fall_back_to_stream());
            inner.persist_logged(slot).await;
            Ok(Step::Restart)
        }
        RunOutcome::LengthChanged { reported } => Ok(Step::LengthChanged(reported)),
    }
}

async fn run_stream(
    inner: &Arc<Inner>,
    slot: &Arc<Slot>,
    abort: &AbortToken,
    storage: StorageWriter,
    resumable: bool,
) -> Result<Step, MissionFailure> {
    let m = slot.snapshot();
    let start = if resumable { m.stream_offset } else { 0 };
    if start == 0 && m.stream_offset > 0 {
        tracing::info!(mission = %m.id, discarded = m.stream_offset, "server cannot resume; restarting stream from byte 0");
        storage.truncate().map_err(storage_failure)?;
    }
    tracing::debug!(mission = %m.id, offset = start, resumable, "starting stream fetch");

    let written = Arc::new(AtomicU64::new(start));
    let (tick_tx, tick_rx) = mpsc::unbounded_channel::<()>();
    let source: BytesSource = {
        let written = Arc::clone(&written);
        Arc::new(move || written.load(Ordering::Relaxed))
    };
    let reporter = spawn_reporter(
        reporter_config(inner, slot),
        source,
        tick_rx,
        inner.events.clone(),
    );

    let checkpoints = resumable
        .then(|| spawn_checkpoints(inner, slot, storage.clone(), Arc::clone(&written), start));

    let expected = (m.length > 0).then_some(m.length);
    let urls = m.urls.clone();
    let policy = inner.config.retry_policy();
    let curl = inner.config.curl_options();
    let on_failure = failure_hook(inner, slot);
    let (halt, st, counter) = (abort.clone(), storage.clone(), Arc::clone(&written));
    let result = blocking(move || {
        run_with_retry(
            &policy,
            &urls,
            || halt.is_aborted(),
            |e, attempt| on_failure(0, attempt, e),
            |url| {
                let offset = if resumable {
                    counter.load(Ordering::Relaxed)
                } else {
                    0
                };
                let req = StreamFetch {
                    url,
                    offset,
                    expected,
                    storage: &st,
                    written: &counter,
                    abort: &halt,
                };
                fetch_stream(&req, &curl)
            },
        )
    })
    .await?;
    if let Some((stop, task)) = checkpoints {
        let _ = stop.send(());
        let _ = task.await;
    }
    drop(tick_tx);
    let _ = reporter.await;

    let flushed = storage.sync().is_ok();
    let reached = written.load(Ordering::Relaxed);
    let keep = |m: &mut crate::mission::Mission| {
        m.stream_offset = if resumable && flushed { reached } else { 0 };
        m.touch();
    };
    match result {
        Ok(0) => Err(MissionFailure::new(
            ErrorCode::NoContent,
            "resource is empty",
        )),
        Ok(total) => {
            slot.with(|m| {
                if m.length == 0 {
                    m.length = total;
                }
                m.stream_offset = total;
            });
            Ok(Step::Done(storage))
        }
        Err(ChunkError::Aborted) => {
            slot.with(keep);
            inner.persist_logged(slot).await;
            Ok(Step::Stopped)
        }
        Err(ChunkError::RangeIgnored) => {
            tracing::info!(mission = %slot.id, discarded = reached, "server ignored Range on resume; restarting stream from byte 0");
            storage.truncate().map_err(storage_failure)?;
            slot.with(|m| {
                m.mode = TransferMode::Stream { resumable: false };
                m.stream_offset = 0;
                m.touch();
            });
            inner.persist_logged(slot).await;
            Ok(Step::Restart)
        }
        Err(ChunkError::LengthChanged { reported, .. }) => Ok(Step::LengthChanged(reported)),
        Err(e) => {
            slot.with(keep);
            Err(e.to_failure())
        }
    }
}

/// Once per progress interval, flushes the partial file and writes the
/// flushed offset through to the store. A crash mid-stream then resumes from
/// the last checkpoint instead of byte 0.
fn spawn_checkpoints(
    inner: &Arc<Inner>,
    slot: &Arc<Slot>,
    storage: StorageWriter,
    written: Arc<AtomicU64>,
    mut saved: u64,
) -> (oneshot::Sender<()>, JoinHandle<()>) {
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let (inner, slot) = (Arc::clone(inner), Arc::clone(slot));
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(inner.config.progress_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = &mut stop_rx => return,
                _ = ticker.tick() => {}
            }
            // Read before the sync so the recorded offset is never past the flushed bytes.
            let reached = written.load(Ordering::Relaxed);
            if reached <= saved {
                continue;
            }
            let st = storage.clone();
            match blocking(move || st.sync()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(mission = %slot.id, "checkpoint sync failed: {}", e);
                    continue;
                }
                Err(_) => continue,
            }
            slot.with(|m| {
                m.stream_offset = reached;
                m.touch();
            });
            inner.persist_logged(&slot).await;
            saved = reached;
        }
    });
    (stop_tx, task)
}

/// Flushes, checks the length and renames the partial file into place.
async fn finalize(
    inner: &Arc<Inner>,
    slot: &Arc<Slot>,
    storage: StorageWriter,
) -> Result<(), MissionFailure> {
    let m = slot.snapshot();
    let final_path = m.path();
    let length = m.length;
    blocking(move || -> io::Result<()> {
        storage.sync()?;
        let on_disk = storage.len()?;
        if on_disk > length {
            storage.set_len(length)?;
            storage.sync()?;
        } else if on_disk < length {
            return Err(io::Error::other(format!(
                "partial file holds {} bytes, expected {}",
                on_disk, length
            )));
        }
        storage.finalize(&final_path)
    })
    .await?
    .map_err(storage_failure)?;

    if let Err((from, to)) = slot.with(|m| m.set_status(MissionStatus::Finished)) {
        tracing::warn!(mission = %slot.id, %from, %to, "unexpected transition at finish");
    }
    inner.persist_logged(slot).await;
    let _ = inner.events.send(MissionEvent::Progress(ProgressUpdate {
        mission_id: slot.id.clone(),
        fraction: 1.0,
        bytes_per_second: 0.0,
        eta: Some(Duration::ZERO),
        bytes_done: length,
        total: length,
    }));
    inner.announce(slot);
    Ok(())
}
