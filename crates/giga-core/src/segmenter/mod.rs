//! Range math and chunk planning.
//!
//! Splits a resource into fixed-size chunks, computes the byte ranges sent to
//! libcurl, and encodes per-chunk state compactly for the mission store.

mod range;
mod state_map;

pub use range::{plan_chunks, Chunk};
pub use state_map::{ChunkState, ChunkStateMap, CorruptStateMap};
