//! Durable mission persistence.
//!
//! Missions are keyed by their destination `(location, name)`, the real-world
//! uniqueness constraint. `update` rewrites the whole row and is a no-op for a
//! deleted mission, so a late write-through cannot resurrect a cancelled one.

mod memory;
mod sqlite;

pub use memory::MemoryMissionStore;
pub use sqlite::SqliteMissionStore;

use async_trait::async_trait;
use std::path::PathBuf;

use crate::mission::Mission;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("a mission already exists for {0}")]
    Duplicate(PathBuf),
    /// Persisted state that cannot be decoded. Fatal at engine start.
    #[error("corrupt mission record {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait MissionStore: Send + Sync {
    /// Every mission, oldest `created_at` first.
    async fn load_all(&self) -> Result<Vec<Mission>, StoreError>;

    /// Inserts a new mission; `Duplicate` if its destination is taken.
    async fn add(&self, mission: &Mission) -> Result<(), StoreError>;

    /// Replaces the stored row for the mission's destination. Idempotent.
    async fn update(&self, mission: &Mission) -> Result<(), StoreError>;

    async fn delete(&self, mission: &Mission) -> Result<(), StoreError>;
}
