//! `giga run` – download every queued mission, then exit.

use anyhow::Result;
use giga_core::{DownloadEngine, MissionEvent};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;

use crate::cli::control_socket;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

pub async fn run_engine(engine: DownloadEngine) -> Result<()> {
    let socket_path = giga_core::control::default_control_socket_path().ok();
    let listener = socket_path.as_ref().and_then(|path| {
        match control_socket::spawn_control_listener(engine.clone(), path) {
            Ok(handle) => {
                tracing::debug!(path = %path.display(), "control socket listening");
                Some(handle)
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), "control socket bind: {}", e);
                None
            }
        }
    });

    let mut events = engine.subscribe();
    let printer = tokio::spawn(async move {
        let mut last_print: Option<Instant> = None;
        loop {
            match events.recv().await {
                Ok(MissionEvent::Progress(p)) => {
                    let now = Instant::now();
                    let recent = last_print.is_some_and(|t| now.duration_since(t) < PROGRESS_INTERVAL);
                    if recent && p.fraction < 1.0 {
                        continue;
                    }
                    last_print = Some(now);
                    let eta = p
                        .eta
                        .map(|d| format!("{}s", d.as_secs()))
                        .unwrap_or_else(|| "?".to_string());
                    println!(
                        "  {}  {:.1} / {:.1} MiB ({:.1}%)  {:.2} MiB/s  ETA {}",
                        p.mission_id,
                        p.bytes_done as f64 / 1_048_576.0,
                        p.total as f64 / 1_048_576.0,
                        p.fraction * 100.0,
                        p.bytes_per_second / 1_048_576.0,
                        eta
                    );
                }
                Ok(MissionEvent::Status { id, status, error }) => match error {
                    Some(err) => println!("{id}: {status} ({err})"),
                    None => println!("{id}: {status}"),
                },
                Ok(MissionEvent::Removed { id }) => println!("{id}: removed"),
                Ok(MissionEvent::ChunkFailed { .. }) => {}
                Err(RecvError::Lagged(n)) => tracing::debug!(skipped = n, "progress printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::select! {
        _ = engine.run_until_idle() => {}
        _ = tokio::signal::ctrl_c() => {
            println!("Interrupted; stopping downloads.");
            engine.shutdown().await;
        }
    }

    if let Some(handle) = listener {
        handle.abort();
    }
    if let Some(path) = socket_path {
        let _ = std::fs::remove_file(path);
    }
    printer.abort();

    let missions = engine.missions();
    let unfinished = missions
        .iter()
        .filter(|m| m.status != giga_core::MissionStatus::Finished)
        .count();
    tracing::info!(missions = missions.len(), unfinished, "run completed");
    println!("{} mission(s), {} not finished", missions.len(), unfinished);
    Ok(())
}
