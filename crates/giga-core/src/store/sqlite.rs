//! SQLite-backed mission store.
//!
//! One row per mission keyed by `(location, name)`. Chunk states are packed
//! four to a byte in `chunk_state`; a blob whose length does not match
//! `chunk_count` is reported as corrupt rather than guessed at.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::{MissionStore, StoreError};
use crate::mission::{ErrorCode, Mission, MissionFailure, MissionId, MissionStatus, TransferMode};
use crate::segmenter::ChunkStateMap;

/// Percent-encode a path for use in a sqlite:// URI so spaces and special chars don't break parsing.
fn path_to_sqlite_uri(path: &Path) -> String {
    let s = path.to_string_lossy();
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '%' => out.push_str("%25"),
            ' ' => out.push_str("%20"),
            '#' => out.push_str("%23"),
            '?' => out.push_str("%3F"),
            '&' => out.push_str("%26"),
            c => out.push(c),
        }
    }
    format!("sqlite://{}", out)
}

/// Handle to the mission database.
///
/// The default file lives under the XDG state directory:
/// `~/.local/state/giga/missions.db`.
pub struct SqliteMissionStore {
    pool: Pool<Sqlite>,
    /// Serializes writers so pooled connections never race for the write lock.
    write_lock: Mutex<()>,
}

impl SqliteMissionStore {
    /// Open (or create) the default database and run migrations.
    pub async fn open_default() -> Result<Self> {
        let xdg_dirs = xdg::BaseDirectories::with_prefix("giga")?;
        let db_path = xdg_dirs.place_state_file("missions.db")?;
        Ok(Self::open_at(db_path).await?)
    }

    /// Open (or create) the database at a specific path. Creates parent dirs if needed.
    pub async fn open_at(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let uri = path_to_sqlite_uri(path) + "?mode=rwc";
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(&uri)
            .await?;
        let store = Self {
            pool,
            write_lock: Mutex::new(()),
        };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory database (single connection, nothing touches disk).
    pub async fn open_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self {
            pool,
            write_lock: Mutex::new(()),
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS missions (
                id TEXT NOT NULL,
                location TEXT NOT NULL,
                name TEXT NOT NULL,
                urls_json TEXT NOT NULL,
                length INTEGER NOT NULL DEFAULT 0,
                block_size INTEGER NOT NULL,
                chunk_count INTEGER NOT NULL DEFAULT 0,
                chunk_state BLOB NOT NULL DEFAULT x'',
                mode TEXT NOT NULL,
                stream_offset INTEGER NOT NULL DEFAULT 0,
                etag TEXT,
                last_modified TEXT,
                status TEXT NOT NULL,
                error_code INTEGER,
                error_message TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (location, name)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Raw pool access for maintenance and tests.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

/// Column values shared by INSERT and UPDATE.
struct Encoded {
    location: String,
    urls_json: String,
    chunk_state: Vec<u8>,
    error_code: Option<i64>,
    error_message: Option<String>,
}

fn encode(m: &Mission) -> Result<Encoded, StoreError> {
    let urls_json = serde_json::to_string(&m.urls).map_err(|e| StoreError::Corrupt {
        key: m.id.to_string(),
        reason: format!("cannot encode urls: {}", e),
    })?;
    Ok(Encoded {
        location: m.location.to_string_lossy().into_owned(),
        urls_json,
        chunk_state: ChunkStateMap::from_states(&m.chunks).to_bytes(),
        error_code: m.error.as_ref().map(|f| f.code.code()),
        error_message: m.error.as_ref().map(|f| f.message.clone()),
    })
}

fn decode(row: &SqliteRow) -> Result<Mission, StoreError> {
    let location: String = row.try_get("location")?;
    let name: String = row.try_get("name")?;
    let location = PathBuf::from(location);
    let id = MissionId::for_destination(&location, &name);
    let key = format!("{} ({})", id, location.join(&name).display());
    let corrupt = |reason: String| StoreError::Corrupt {
        key: key.clone(),
        reason,
    };

    let urls_json: String = row.try_get("urls_json")?;
    let urls: Vec<String> =
        serde_json::from_str(&urls_json).map_err(|e| corrupt(format!("bad urls_json: {}", e)))?;

    let status_str: String = row.try_get("status")?;
    let status = MissionStatus::parse(&status_str)
        .ok_or_else(|| corrupt(format!("unknown status {:?}", status_str)))?;

    let mode_str: String = row.try_get("mode")?;
    let mode = TransferMode::parse(&mode_str)
        .ok_or_else(|| corrupt(format!("unknown mode {:?}", mode_str)))?;

    let chunk_count: i64 = row.try_get("chunk_count")?;
    let blob: Vec<u8> = row.try_get("chunk_state")?;
    let chunk_count = usize::try_from(chunk_count)
        .map_err(|_| corrupt(format!("negative chunk_count {}", chunk_count)))?;
    let chunks = ChunkStateMap::from_bytes(&blob, chunk_count)
        .map_err(|e| corrupt(e.to_string()))?
        .to_states();

    let error_code: Option<i64> = row.try_get("error_code")?;
    let error_message: Option<String> = row.try_get("error_message")?;
    let error = match error_code {
        Some(code) => {
            let code = ErrorCode::from_code(code)
                .ok_or_else(|| corrupt(format!("unknown error code {}", code)))?;
            Some(MissionFailure::new(code, error_message.unwrap_or_default()))
        }
        None => None,
    };

    let length: i64 = row.try_get("length")?;
    let block_size: i64 = row.try_get("block_size")?;
    let stream_offset: i64 = row.try_get("stream_offset")?;
    if length < 0 || block_size <= 0 || stream_offset < 0 {
        return Err(corrupt("negative size field".to_string()));
    }

    let mission = Mission {
        id,
        urls,
        location,
        name,
        length: length as u64,
        block_size: block_size as u64,
        chunks,
        mode,
        stream_offset: stream_offset as u64,
        etag: row.try_get("etag")?,
        last_modified: row.try_get("last_modified")?,
        status,
        error,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    };
    if mission.mode == TransferMode::Chunked && mission.chunks.len() != mission.plan().len() {
        return Err(corrupt(format!(
            "{} chunk states for a plan of {}",
            mission.chunks.len(),
            mission.plan().len()
        )));
    }
    Ok(mission)
}

#[async_trait]
impl MissionStore for SqliteMissionStore {
    async fn load_all(&self) -> Result<Vec<Mission>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT location, name, urls_json, length, block_size, chunk_count,
                   chunk_state, mode, stream_offset, etag, last_modified,
                   status, error_code, error_message, created_at, updated_at
            FROM missions
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode).collect()
    }

    async fn add(&self, mission: &Mission) -> Result<(), StoreError> {
        let enc = encode(mission)?;
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            r#"
            INSERT INTO missions (
                id, location, name, urls_json, length, block_size, chunk_count,
                chunk_state, mode, stream_offset, etag, last_modified,
                status, error_code, error_message, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            "#,
        )
        .bind(mission.id.as_str())
        .bind(&enc.location)
        .bind(&mission.name)
        .bind(&enc.urls_json)
        .bind(mission.length as i64)
        .bind(mission.block_size as i64)
        .bind(mission.chunks.len() as i64)
        .bind(&enc.chunk_state)
        .bind(mission.mode.as_str())
        .bind(mission.stream_offset as i64)
        .bind(&mission.etag)
        .bind(&mission.last_modified)
        .bind(mission.status.as_str())
        .bind(enc.error_code)
        .bind(&enc.error_message)
        .bind(mission.created_at)
        .bind(mission.updated_at)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::Duplicate(mission.path()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, mission: &Mission) -> Result<(), StoreError> {
        let enc = encode(mission)?;
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            r#"
            UPDATE missions
            SET urls_json = ?1,
                length = ?2,
                block_size = ?3,
                chunk_count = ?4,
                chunk_state = ?5,
                mode = ?6,
                stream_offset = ?7,
                etag = ?8,
                last_modified = ?9,
                status = ?10,
                error_code = ?11,
                error_message = ?12,
                updated_at = ?13
            WHERE location = ?14 AND name = ?15
            "#,
        )
        .bind(&enc.urls_json)
        .bind(mission.length as i64)
        .bind(mission.block_size as i64)
        .bind(mission.chunks.len() as i64)
        .bind(&enc.chunk_state)
        .bind(mission.mode.as_str())
        .bind(mission.stream_offset as i64)
        .bind(&mission.etag)
        .bind(&mission.last_modified)
        .bind(mission.status.as_str())
        .bind(enc.error_code)
        .bind(&enc.error_message)
        .bind(mission.updated_at)
        .bind(&enc.location)
        .bind(&mission.name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, mission: &Mission) -> Result<(), StoreError> {
        let location = mission.location.to_string_lossy().into_owned();
        let _guard = self.write_lock.lock().await;
        sqlx::query("DELETE FROM missions WHERE location = ?1 AND name = ?2")
            .bind(location)
            .bind(&mission.name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
