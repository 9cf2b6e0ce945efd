use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::downloader::CurlOptions;
use crate::retry::RetryPolicy;

/// Retry policy parameters (optional section in config.toml).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts per chunk and URL (including the first).
    pub max_attempts: u32,
    /// Base delay in seconds for exponential backoff (e.g. 0.25 = 250ms).
    pub base_delay_secs: f64,
    /// Maximum backoff delay in seconds.
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_secs: 0.25,
            max_delay_secs: 30,
        }
    }
}

/// When progress updates are pushed to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProgressCadence {
    /// At most once per `progress_interval_ms`.
    #[default]
    Interval,
    /// Once per completed chunk.
    PerChunk,
}

/// Global configuration loaded from `~/.config/giga/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Missions allowed in `Running` at the same time; the rest wait as `Pending`.
    pub max_running_missions: usize,
    /// Maximum concurrent HTTP connections across all missions.
    pub max_total_connections: usize,
    /// Range fetchers per mission. 1 forces single-stream mode.
    pub connections_per_mission: usize,
    /// Default chunk size in bytes for new missions.
    pub block_size: u64,
    /// Receive buffer handed to libcurl, in bytes.
    pub buffer_size: usize,
    pub connect_timeout_secs: u64,
    /// A transfer that moves no bytes for this long fails (retryable).
    pub stall_timeout_secs: u64,
    pub progress_interval_ms: u64,
    #[serde(default)]
    pub progress_cadence: ProgressCadence,
    pub user_agent: String,
    /// Optional retry policy; if missing, built-in defaults are used.
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_running_missions: 3,
            max_total_connections: 16,
            connections_per_mission: 3,
            block_size: 512 * 1024,
            buffer_size: 64 * 1024,
            connect_timeout_secs: 30,
            stall_timeout_secs: 30,
            progress_interval_ms: 200,
            progress_cadence: ProgressCadence::Interval,
            user_agent: format!("giga/{}", env!("CARGO_PKG_VERSION")),
            retry: None,
        }
    }
}

impl EngineConfig {
    /// Retry policy from the `[retry]` table, or the built-in default.
    pub fn retry_policy(&self) -> RetryPolicy {
        match &self.retry {
            Some(r) => RetryPolicy {
                max_attempts: r.max_attempts.max(1),
                base_delay: Duration::from_secs_f64(r.base_delay_secs.max(0.0)),
                max_delay: Duration::from_secs(r.max_delay_secs),
            },
            None => RetryPolicy::default(),
        }
    }

    pub fn curl_options(&self) -> CurlOptions {
        CurlOptions {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
            stall_timeout: Duration::from_secs(self.stall_timeout_secs.max(1)),
            buffer_size: self.buffer_size,
            user_agent: self.user_agent.clone(),
        }
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms.max(10))
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("giga")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<EngineConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = EngineConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: EngineConfig = toml::from_str(&data)?;
    Ok(cfg)
}
