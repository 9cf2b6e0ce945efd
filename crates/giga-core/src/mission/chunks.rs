//! Live chunk table shared by the fetchers of one running mission.
//!
//! Status changes go through a single mutex; byte counters are per-chunk
//! atomics so the progress reporter can read them without taking the lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::segmenter::{Chunk, ChunkState};

pub struct ChunkTable {
    chunks: Vec<Chunk>,
    states: Mutex<Vec<ChunkState>>,
    written: Vec<AtomicU64>,
}

impl ChunkTable {
    /// Builds the table for a run from the persisted states.
    ///
    /// `InProgress` and `Failed` entries come back as `Pending`; only `Done` survives.
    pub fn new(chunks: Vec<Chunk>, persisted: &[ChunkState]) -> Self {
        let states: Vec<ChunkState> = (0..chunks.len())
            .map(|i| match persisted.get(i) {
                Some(ChunkState::Done) => ChunkState::Done,
                _ => ChunkState::Pending,
            })
            .collect();
        let written = chunks
            .iter()
            .zip(&states)
            .map(|(c, s)| AtomicU64::new(if *s == ChunkState::Done { c.len() } else { 0 }))
            .collect();
        Self {
            chunks,
            states: Mutex::new(states),
            written,
        }
    }

    fn states(&self) -> MutexGuard<'_, Vec<ChunkState>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn chunk(&self, index: usize) -> Chunk {
        self.chunks[index]
    }

    /// Byte counter of one chunk (bytes written by the current attempt).
    pub fn written(&self, index: usize) -> &AtomicU64 {
        &self.written[index]
    }

    /// Claims the lowest-indexed `Pending` chunk and marks it `InProgress`.
    pub fn claim_next(&self) -> Option<usize> {
        let mut states = self.states();
        let index = states.iter().position(|s| *s == ChunkState::Pending)?;
        states[index] = ChunkState::InProgress;
        Some(index)
    }

    /// Starts a (re)try of a claimed chunk: bytes from an earlier attempt no longer count.
    pub fn begin_attempt(&self, index: usize) {
        self.states()[index] = ChunkState::InProgress;
        self.written[index].store(0, Ordering::Relaxed);
    }

    pub fn mark_failed(&self, index: usize) {
        self.states()[index] = ChunkState::Failed;
    }

    pub fn mark_done(&self, index: usize) {
        self.states()[index] = ChunkState::Done;
        self.written[index].fetch_max(self.chunks[index].len(), Ordering::Relaxed);
    }

    /// Returns an aborted chunk to `Pending`; its partial bytes are discarded.
    pub fn release(&self, index: usize) {
        self.states()[index] = ChunkState::Pending;
        self.written[index].store(0, Ordering::Relaxed);
    }

    pub fn state(&self, index: usize) -> ChunkState {
        self.states()[index]
    }

    pub fn snapshot(&self) -> Vec<ChunkState> {
        self.states().clone()
    }

    /// Chunks not yet `Done`.
    pub fn remaining(&self) -> usize {
        self.states().iter().filter(|s| **s != ChunkState::Done).count()
    }

    pub fn all_done(&self) -> bool {
        self.remaining() == 0
    }

    /// Bytes of `Done` chunks plus bytes written so far by in-flight chunks.
    pub fn bytes_done(&self) -> u64 {
        self.written.iter().map(|w| w.load(Ordering::Relaxed)).sum()
    }
}
