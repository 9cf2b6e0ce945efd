//! `giga add <url>...` – queue a mission.

use std::path::PathBuf;

use anyhow::Result;
use giga_core::DownloadEngine;

pub async fn run_add(
    engine: &DownloadEngine,
    urls: Vec<String>,
    dir: PathBuf,
    name: String,
    block_size: Option<u64>,
) -> Result<()> {
    let mission = engine.create_mission(urls, dir, name, block_size).await?;
    println!(
        "Added mission {} -> {}",
        mission.id,
        mission.path().display()
    );
    Ok(())
}
