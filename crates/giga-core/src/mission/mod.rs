//! Missions: one logical download job per destination file.
//!
//! A mission records its source URLs, destination, probed length, chunk
//! plan and per-chunk status. The engine keeps the authoritative copy in
//! memory and writes it through to the mission store on every chunk
//! completion and every status change.

mod chunks;
mod failure;
mod status;

pub use chunks::ChunkTable;
pub use failure::{ErrorCode, FailureClass, MissionFailure};
pub use status::MissionStatus;

use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::fetch_head::ProbeResult;
use crate::segmenter::{plan_chunks, Chunk, ChunkState};
use crate::storage;

/// Stable mission identity: hex digest of the destination path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MissionId(String);

impl MissionId {
    pub fn for_destination(location: &Path, name: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(location.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(name.as_bytes());
        let digest = hasher.finalize();
        MissionId(hex::encode(&digest[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for MissionId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() == 16 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            Ok(MissionId(s.to_ascii_lowercase()))
        } else {
            Err(format!("not a mission id: {s:?}"))
        }
    }
}

/// How the bytes of a mission are fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Not probed yet; length and range support unknown.
    Unprobed,
    /// Parallel ranged GETs, one per chunk.
    Chunked,
    /// One unpartitioned GET. `resumable` means the server honours `Range`
    /// so an interrupted stream continues at `stream_offset`.
    Stream { resumable: bool },
}

impl TransferMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferMode::Unprobed => "unprobed",
            TransferMode::Chunked => "chunked",
            TransferMode::Stream { resumable: false } => "stream",
            TransferMode::Stream { resumable: true } => "stream-resumable",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unprobed" => Some(TransferMode::Unprobed),
            "chunked" => Some(TransferMode::Chunked),
            "stream" => Some(TransferMode::Stream { resumable: false }),
            "stream-resumable" => Some(TransferMode::Stream { resumable: true }),
            _ => None,
        }
    }
}

/// Current time as Unix milliseconds (mission timestamps).
pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Suggests a file name from the last path segment of a URL.
pub fn name_from_url(raw: &str) -> Option<String> {
    let parsed = url::Url::parse(raw).ok()?;
    let last = parsed.path_segments()?.next_back()?;
    let name = last.trim();
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    Some(name.to_string())
}

#[derive(Debug, Clone, PartialEq)]
pub struct Mission {
    pub id: MissionId,
    /// Source URLs in mirror order.
    pub urls: Vec<String>,
    pub location: PathBuf,
    pub name: String,
    /// Total bytes; 0 while unknown.
    pub length: u64,
    pub block_size: u64,
    /// Per-chunk status, indexed by chunk number. Empty in stream mode.
    pub chunks: Vec<ChunkState>,
    pub mode: TransferMode,
    /// Bytes durably written by a stream-mode transfer.
    pub stream_offset: u64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub status: MissionStatus,
    pub error: Option<MissionFailure>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Mission {
    pub fn new(urls: Vec<String>, location: PathBuf, name: String, block_size: u64) -> Self {
        let now = unix_millis();
        Mission {
            id: MissionId::for_destination(&location, &name),
            urls,
            location,
            name,
            length: 0,
            block_size: block_size.max(1),
            chunks: Vec::new(),
            mode: TransferMode::Unprobed,
            stream_offset: 0,
            etag: None,
            last_modified: None,
            status: MissionStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Final destination path.
    pub fn path(&self) -> PathBuf {
        self.location.join(&self.name)
    }

    /// Partial file written while the mission is incomplete.
    pub fn temp_path(&self) -> PathBuf {
        storage::temp_path(&self.path())
    }

    pub fn touch(&mut self) {
        self.updated_at = unix_millis().max(self.created_at);
    }

    /// Chunk ranges for chunked mode (empty otherwise).
    pub fn plan(&self) -> Vec<Chunk> {
        match self.mode {
            TransferMode::Chunked => plan_chunks(self.length, self.block_size),
            _ => Vec::new(),
        }
    }

    /// Bytes confirmed on disk: `Done` chunks, or the stream offset.
    pub fn bytes_done(&self) -> u64 {
        if self.status == MissionStatus::Finished {
            return self.length;
        }
        match self.mode {
            TransferMode::Chunked => self
                .plan()
                .iter()
                .zip(&self.chunks)
                .filter(|(_, s)| **s == ChunkState::Done)
                .map(|(c, _)| c.len())
                .sum(),
            TransferMode::Stream { .. } => self.stream_offset,
            TransferMode::Unprobed => 0,
        }
    }

    /// Fraction complete in [0.0, 1.0]; 0 while the length is unknown.
    pub fn fraction(&self) -> f64 {
        if self.status == MissionStatus::Finished {
            return 1.0;
        }
        if self.length == 0 {
            return 0.0;
        }
        (self.bytes_done() as f64 / self.length as f64).min(1.0)
    }

    /// True if a restart would reuse bytes already in the partial file.
    pub fn has_progress(&self) -> bool {
        self.stream_offset > 0 || self.chunks.contains(&ChunkState::Done)
    }

    /// Moves to `to` if the state machine allows it.
    pub fn set_status(&mut self, to: MissionStatus) -> Result<(), (MissionStatus, MissionStatus)> {
        if self.status == to {
            return Ok(());
        }
        if !self.status.can_transition_to(to) {
            return Err((self.status, to));
        }
        self.status = to;
        if to != MissionStatus::Error {
            self.error = None;
        }
        self.touch();
        Ok(())
    }

    /// Records a failure and moves to `Error`.
    pub fn fail(&mut self, failure: MissionFailure) {
        self.status = MissionStatus::Error;
        self.error = Some(failure);
        self.touch();
    }

    /// Forgets written bytes but keeps the probe (length, mode, validators).
    pub fn reset_progress(&mut self) {
        self.chunks.iter_mut().for_each(|s| *s = ChunkState::Pending);
        self.stream_offset = 0;
        self.touch();
    }

    /// Forgets everything learned from the server.
    pub fn forget_probe(&mut self) {
        self.length = 0;
        self.chunks.clear();
        self.mode = TransferMode::Unprobed;
        self.stream_offset = 0;
        self.etag = None;
        self.last_modified = None;
        self.touch();
    }

    /// `Failed` (and stale `InProgress`) chunks go back to `Pending`; `Done` is untouched.
    pub fn reset_failed_chunks(&mut self) {
        for s in &mut self.chunks {
            if *s != ChunkState::Done {
                *s = ChunkState::Pending;
            }
        }
    }

    /// Fills length, mode, chunk plan and validators from a probe.
    pub fn adopt_probe(&mut self, probe: &ProbeResult, connections: usize) {
        self.length = probe.length.unwrap_or(0);
        self.etag = probe.etag.clone();
        self.last_modified = probe.last_modified.clone();
        self.stream_offset = 0;
        self.mode = match probe.length {
            Some(len) if probe.ranges && len > 0 && connections > 1 => TransferMode::Chunked,
            _ => TransferMode::Stream {
                resumable: probe.ranges,
            },
        };
        self.chunks = vec![ChunkState::Pending; self.plan().len()];
        self.touch();
    }

    /// Switches to one unpartitioned, non-resumable stream from byte zero.
    pub fn fall_back_to_stream(&mut self) {
        self.mode = TransferMode::Stream { resumable: false };
        self.chunks.clear();
        self.stream_offset = 0;
        self.touch();
    }

    /// False if the remote resource changed since the mission was probed
    /// (ETag, Last-Modified or size differ).
    pub fn matches_remote(&self, probe: &ProbeResult) -> bool {
        fn changed<T: PartialEq>(a: &Option<T>, b: &Option<T>) -> bool {
            match (a, b) {
                (None, None) => false,
                (Some(a), Some(b)) => a != b,
                _ => true,
            }
        }
        let stored_len = (self.length > 0).then_some(self.length);
        !(changed(&self.etag, &probe.etag)
            || changed(&self.last_modified, &probe.last_modified)
            || changed(&stored_len, &probe.length))
    }
}
