//! Chunk worker pool for one mission run.
//!
//! Workers are plain threads that claim the lowest pending chunk, run it
//! through the retry loop and report the result on a channel. The calling
//! thread is the coordinator: it records `Done`, flushes the file and tells
//! the caller, or stops the run on the first fatal error.

use std::sync::mpsc;
use std::sync::Arc;

use crate::control::AbortToken;
use crate::downloader::{fetch_chunk, ChunkFetch, CurlOptions, RangeGate};
use crate::mission::ChunkTable;
use crate::retry::{run_with_retry, ChunkError, RetryPolicy};
use crate::storage::StorageWriter;

/// Called after every failed attempt: `(chunk index, attempt, error)`.
pub type FailureHook = Arc<dyn Fn(usize, u32, &ChunkError) + Send + Sync>;

/// Everything the pool needs to fetch the remaining chunks of a mission.
pub struct ChunkJob {
    pub urls: Arc<Vec<String>>,
    pub table: Arc<ChunkTable>,
    /// Probed length of the resource.
    pub total: u64,
    pub storage: StorageWriter,
    /// Fetcher threads to start (capped by the remaining chunk count).
    pub workers: usize,
    pub policy: RetryPolicy,
    pub curl: CurlOptions,
    /// Tripped by pause/cancel, and by the coordinator on a fatal error.
    /// Pass a child of the mission token so a fatal error stays local to the run.
    pub abort: AbortToken,
    pub on_failure: FailureHook,
}

/// How a run ended.
#[derive(Debug)]
pub enum RunOutcome {
    /// Every chunk is `Done` and flushed.
    Completed,
    /// Pause or cancel; unfinished chunks are back to `Pending`.
    Aborted,
    /// A chunk ran out of retries or hit a permanent error.
    Failed { index: usize, error: ChunkError },
    /// The server answered a ranged request with the full body.
    RangeIgnored,
    /// The server reported a different total length.
    LengthChanged { reported: u64 },
}

/// Runs the pool until every chunk is `Done`, the run is aborted, or a
/// chunk fails for good. Blocks the calling thread.
///
/// `on_done(index)` runs on the coordinator after chunk `index` was marked
/// `Done` and the file was flushed.
pub fn run_chunks(job: ChunkJob, mut on_done: impl FnMut(usize)) -> RunOutcome {
    let remaining = job.table.remaining();
    if remaining == 0 {
        return RunOutcome::Completed;
    }
    let gate = Arc::new(RangeGate::new());
    let (tx, rx) = mpsc::channel::<(usize, Result<(), ChunkError>)>();
    let num_workers = job.workers.max(1).min(remaining);
    let mut handles = Vec::with_capacity(num_workers);
    for worker in 0..num_workers {
        let tx = tx.clone();
        let table = Arc::clone(&job.table);
        let gate = Arc::clone(&gate);
        let urls = Arc::clone(&job.urls);
        let storage = job.storage.clone();
        let abort = job.abort.clone();
        let policy = job.policy;
        let curl = job.curl.clone();
        let on_failure = Arc::clone(&job.on_failure);
        let total = job.total;
        let spawned = std::thread::Builder::new()
            .name(format!("giga-fetch-{}", worker))
            .spawn(move || loop {
                if !gate.enter(|| abort.is_aborted()) {
                    break;
                }
                let Some(index) = table.claim_next() else {
                    break;
                };
                let chunk = table.chunk(index);
                tracing::debug!(chunk = index, range = %chunk.curl_range(), "chunk claimed");
                let res = run_with_retry(
                    &policy,
                    &urls,
                    || abort.is_aborted(),
                    |e, attempt| {
                        table.mark_failed(index);
                        on_failure(index, attempt, e);
                    },
                    |url| {
                        table.begin_attempt(index);
                        let req = ChunkFetch {
                            url,
                            chunk,
                            total,
                            storage: &storage,
                            written: table.written(index),
                            abort: &abort,
                            gate: &gate,
                        };
                        fetch_chunk(&req, &curl)
                    },
                );
                if tx.send((index, res)).is_err() {
                    break;
                }
            });
        match spawned {
            Ok(h) => handles.push(h),
            Err(e) => tracing::warn!("could not start fetcher thread: {}", e),
        }
    }
    drop(tx);

    if handles.is_empty() {
        return RunOutcome::Failed {
            index: 0,
            error: ChunkError::Storage(std::io::Error::other("no fetcher thread could be started")),
        };
    }

    let mut outcome: Option<RunOutcome> = None;
    let stop = |outcome: &mut Option<RunOutcome>, result: RunOutcome| {
        if outcome.is_none() {
            *outcome = Some(result);
        }
        gate.close();
        job.abort.abort();
    };
    // All senders are gone once every worker has exited.
    while let Ok((index, res)) = rx.recv() {
        match res {
            Ok(()) => {
                job.table.mark_done(index);
                if let Err(e) = job.storage.sync() {
                    job.table.mark_failed(index);
                    stop(
                        &mut outcome,
                        RunOutcome::Failed {
                            index,
                            error: ChunkError::Storage(e),
                        },
                    );
                    continue;
                }
                tracing::debug!(chunk = index, "chunk done");
                on_done(index);
            }
            Err(ChunkError::Aborted) => job.table.release(index),
            Err(ChunkError::RangeIgnored) => {
                job.table.release(index);
                tracing::warn!("server ignored Range; abandoning chunked transfer");
                stop(&mut outcome, RunOutcome::RangeIgnored);
            }
            Err(ChunkError::LengthChanged { expected, reported }) => {
                job.table.release(index);
                tracing::warn!(expected, reported, "resource length changed mid-download");
                stop(&mut outcome, RunOutcome::LengthChanged { reported });
            }
            Err(error) => {
                job.table.mark_failed(index);
                tracing::warn!(chunk = index, "chunk failed: {}", error);
                stop(&mut outcome, RunOutcome::Failed { index, error });
            }
        }
    }
    for h in handles {
        if h.join().is_err() {
            tracing::warn!("fetcher thread panicked");
        }
    }

    match outcome {
        Some(o) => o,
        None if job.table.all_done() => RunOutcome::Completed,
        None => RunOutcome::Aborted,
    }
}
