//! Per-chunk state map for resume: two bits per chunk, serialized to a DB BLOB.

use std::fmt;

/// Status of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChunkState {
    #[default]
    Pending,
    InProgress,
    Done,
    Failed,
}

impl ChunkState {
    fn to_bits(self) -> u8 {
        match self {
            ChunkState::Pending => 0,
            ChunkState::InProgress => 1,
            ChunkState::Done => 2,
            ChunkState::Failed => 3,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => ChunkState::Pending,
            1 => ChunkState::InProgress,
            2 => ChunkState::Done,
            _ => ChunkState::Failed,
        }
    }
}

/// Returned when a stored blob does not match the recorded chunk count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptStateMap {
    pub chunk_count: usize,
    pub blob_len: usize,
}

impl fmt::Display for CorruptStateMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chunk state blob has {} bytes, expected {} for {} chunks",
            self.blob_len,
            ChunkStateMap::byte_len(self.chunk_count),
            self.chunk_count
        )
    }
}

impl std::error::Error for CorruptStateMap {}

/// Chunk state map: four chunks per byte, chunk 0 in the two low bits.
///
/// Unlike a plain completion bitmap it keeps `Failed` distinct from `Pending`
/// so a reloaded mission still shows which chunk broke it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkStateMap {
    bytes: Vec<u8>,
    len: usize,
}

impl ChunkStateMap {
    fn byte_len(chunk_count: usize) -> usize {
        chunk_count.div_ceil(4)
    }

    /// New map with every chunk `Pending`.
    pub fn new(chunk_count: usize) -> Self {
        ChunkStateMap {
            bytes: vec![0u8; Self::byte_len(chunk_count)],
            len: chunk_count,
        }
    }

    pub fn from_states(states: &[ChunkState]) -> Self {
        let mut map = Self::new(states.len());
        for (i, s) in states.iter().enumerate() {
            map.set(i, *s);
        }
        map
    }

    /// Deserialize from a DB BLOB. The blob must be exactly as long as `chunk_count` needs.
    pub fn from_bytes(bytes: &[u8], chunk_count: usize) -> Result<Self, CorruptStateMap> {
        if bytes.len() != Self::byte_len(chunk_count) {
            return Err(CorruptStateMap {
                chunk_count,
                blob_len: bytes.len(),
            });
        }
        Ok(ChunkStateMap {
            bytes: bytes.to_vec(),
            len: chunk_count,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.bytes.clone()
    }

    pub fn get(&self, index: usize) -> ChunkState {
        if index >= self.len {
            return ChunkState::Pending;
        }
        let shift = (index % 4) * 2;
        ChunkState::from_bits(self.bytes[index / 4] >> shift)
    }

    pub fn set(&mut self, index: usize, state: ChunkState) {
        if index >= self.len {
            return;
        }
        let shift = (index % 4) * 2;
        let byte = &mut self.bytes[index / 4];
        *byte = (*byte & !(0b11 << shift)) | (state.to_bits() << shift);
    }

    pub fn to_states(&self) -> Vec<ChunkState> {
        (0..self.len).map(|i| self.get(i)).collect()
    }
}
