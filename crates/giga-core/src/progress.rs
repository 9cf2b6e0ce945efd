//! Progress reporting for running missions (fraction, rate, ETA).
//!
//! One reporter task per running mission samples the live byte counters and
//! pushes [`ProgressUpdate`]s onto the engine's broadcast channel, either on
//! a fixed interval or once per completed chunk. Sends never block: a slow
//! subscriber lags and skips updates.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::ProgressCadence;
use crate::mission::{MissionFailure, MissionId, MissionStatus};

/// Aggregate progress of one mission.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub mission_id: MissionId,
    /// In [0.0, 1.0]; 0 while the length is unknown.
    pub fraction: f64,
    pub bytes_per_second: f64,
    /// None until a rate is known, or when the length is unknown.
    pub eta: Option<Duration>,
    pub bytes_done: u64,
    /// 0 when unknown.
    pub total: u64,
}

/// Everything subscribers hear about.
#[derive(Debug, Clone)]
pub enum MissionEvent {
    Progress(ProgressUpdate),
    Status {
        id: MissionId,
        status: MissionStatus,
        error: Option<MissionFailure>,
    },
    /// One failed attempt at one chunk (it may still be retried).
    ChunkFailed {
        id: MissionId,
        chunk: usize,
        attempt: u32,
        message: String,
    },
    /// The mission was cancelled or forgotten.
    Removed { id: MissionId },
}

/// Snapshot math shared by the reporter and the CLI.
#[derive(Debug, Clone)]
pub struct ProgressStats {
    pub bytes_done: u64,
    pub total_bytes: u64,
    pub bytes_per_sec: f64,
}

impl ProgressStats {
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.bytes_done as f64 / self.total_bytes as f64).min(1.0)
    }

    /// Estimated time remaining (None if the rate is 0 or the length unknown).
    pub fn eta(&self) -> Option<Duration> {
        if self.total_bytes == 0 {
            return None;
        }
        let remaining = self.total_bytes.saturating_sub(self.bytes_done);
        if remaining == 0 {
            return Some(Duration::ZERO);
        }
        if self.bytes_per_sec <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / self.bytes_per_sec))
    }
}

/// Exponentially smoothed transfer rate.
#[derive(Debug)]
pub struct SpeedMeter {
    last: Option<(Instant, u64)>,
    rate: f64,
}

/// Weight of the newest sample.
const SMOOTHING: f64 = 0.3;

impl SpeedMeter {
    pub fn new() -> Self {
        Self {
            last: None,
            rate: 0.0,
        }
    }

    /// Feeds a new `(time, total bytes)` sample and returns the smoothed rate.
    pub fn sample(&mut self, now: Instant, bytes: u64) -> f64 {
        if let Some((then, prev)) = self.last {
            let dt = now.saturating_duration_since(then).as_secs_f64();
            if dt > 0.0 {
                // Counters drop when a retried chunk restarts; treat that as no progress.
                let instant = bytes.saturating_sub(prev) as f64 / dt;
                self.rate = if self.rate == 0.0 {
                    instant
                } else {
                    SMOOTHING * instant + (1.0 - SMOOTHING) * self.rate
                };
                self.last = Some((now, bytes));
            }
        } else {
            self.last = Some((now, bytes));
        }
        self.rate
    }
}

impl Default for SpeedMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads the live byte count of a running mission.
pub type BytesSource = Arc<dyn Fn() -> u64 + Send + Sync>;

pub struct ReporterConfig {
    pub mission_id: MissionId,
    pub total: u64,
    pub cadence: ProgressCadence,
    pub interval: Duration,
}

/// Starts the reporter for one run.
///
/// `ticks` carries one message per completed chunk; the reporter stops (after a
/// final update) when its sender is dropped.
pub fn spawn_reporter(
    cfg: ReporterConfig,
    source: BytesSource,
    mut ticks: mpsc::UnboundedReceiver<()>,
    events: broadcast::Sender<MissionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut meter = SpeedMeter::new();
        let mut interval = tokio::time::interval(cfg.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let emit = |meter: &mut SpeedMeter| {
            let bytes_done = source();
            let stats = ProgressStats {
                bytes_done,
                total_bytes: cfg.total,
                bytes_per_sec: meter.sample(Instant::now(), bytes_done),
            };
            let _ = events.send(MissionEvent::Progress(ProgressUpdate {
                mission_id: cfg.mission_id.clone(),
                fraction: stats.fraction(),
                bytes_per_second: stats.bytes_per_sec,
                eta: stats.eta(),
                bytes_done,
                total: cfg.total,
            }));
        };
        emit(&mut meter);
        loop {
            tokio::select! {
                tick = ticks.recv() => match tick {
                    Some(()) => {
                        if cfg.cadence == ProgressCadence::PerChunk {
                            emit(&mut meter);
                        }
                    }
                    None => break,
                },
                _ = interval.tick(), if cfg.cadence == ProgressCadence::Interval => {
                    emit(&mut meter);
                }
            }
        }
        emit(&mut meter);
    })
}
