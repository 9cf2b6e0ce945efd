//! `giga forget` – drop finished missions from the database.

use anyhow::Result;
use giga_core::DownloadEngine;

pub async fn run_forget(engine: &DownloadEngine) -> Result<()> {
    let n = engine.forget_finished().await?;
    println!("Forgot {n} finished mission(s)");
    Ok(())
}
