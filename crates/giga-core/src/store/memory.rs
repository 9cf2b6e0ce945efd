//! In-memory store for tests and embedders that do not need durability.

use async_trait::async_trait;
use std::sync::Mutex;

use super::{MissionStore, StoreError};
use crate::mission::Mission;

#[derive(Default)]
pub struct MemoryMissionStore {
    rows: Mutex<Vec<Mission>>,
}

impl MemoryMissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-filled with `missions` (e.g. to simulate a restart).
    pub fn with_missions(missions: Vec<Mission>) -> Self {
        Self {
            rows: Mutex::new(missions),
        }
    }

    fn rows(&self) -> std::sync::MutexGuard<'_, Vec<Mission>> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn same_key(a: &Mission, b: &Mission) -> bool {
    a.location == b.location && a.name == b.name
}

#[async_trait]
impl MissionStore for MemoryMissionStore {
    async fn load_all(&self) -> Result<Vec<Mission>, StoreError> {
        let mut out = self.rows().clone();
        out.sort_by_key(|m| m.created_at);
        Ok(out)
    }

    async fn add(&self, mission: &Mission) -> Result<(), StoreError> {
        let mut rows = self.rows();
        if rows.iter().any(|m| same_key(m, mission)) {
            return Err(StoreError::Duplicate(mission.path()));
        }
        rows.push(mission.clone());
        Ok(())
    }

    async fn update(&self, mission: &Mission) -> Result<(), StoreError> {
        if let Some(row) = self.rows().iter_mut().find(|m| same_key(m, mission)) {
            *row = mission.clone();
        }
        Ok(())
    }

    async fn delete(&self, mission: &Mission) -> Result<(), StoreError> {
        self.rows().retain(|m| !same_key(m, mission));
        Ok(())
    }
}
