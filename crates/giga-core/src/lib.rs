pub mod config;
pub mod logging;

pub mod control;
pub mod downloader;
pub mod engine;
pub mod fetch_head;
pub mod mission;
pub mod progress;
pub mod retry;
pub mod scheduler;
pub mod segmenter;
pub mod storage;
pub mod store;

pub use engine::{DownloadEngine, EngineBuilder, EngineError, MissionCheck};
pub use mission::{Mission, MissionId, MissionStatus};
pub use progress::{MissionEvent, ProgressUpdate};
pub use store::{MemoryMissionStore, MissionStore, SqliteMissionStore, StoreError};
