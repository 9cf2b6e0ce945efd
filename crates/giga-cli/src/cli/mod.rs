//! CLI for the giga downloader.

mod commands;
mod control_socket;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use giga_core::config::{self, EngineConfig};
use giga_core::{DownloadEngine, EngineBuilder, MissionId, SqliteMissionStore};

use commands::{
    run_add, run_completions, run_control, run_engine, run_forget, run_man, run_status,
};
use control_socket::ControlAction;

/// Top-level CLI for the giga downloader.
#[derive(Debug, Parser)]
#[command(name = "giga")]
#[command(about = "giga: resumable multi-connection downloader", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Queue a download. Extra URLs are mirrors of the first, tried in order.
    Add {
        /// HTTP/HTTPS URL(s) of the same resource.
        #[arg(required = true, num_args = 1..)]
        urls: Vec<String>,
        /// Directory to save into (default: current directory).
        #[arg(long, short = 'd', value_name = "DIR")]
        dir: Option<PathBuf>,
        /// File name (default: derived from the first URL).
        #[arg(long, short = 'o')]
        name: Option<String>,
        /// Chunk size in bytes (default: block_size from config).
        #[arg(long, value_name = "BYTES")]
        block_size: Option<u64>,
    },

    /// Download every queued mission, then exit.
    Run,

    /// Show all missions.
    Status,

    /// Pause a pending or running mission.
    Pause {
        /// Mission identifier (see `giga status`).
        id: MissionId,
    },

    /// Resume a paused mission.
    Resume {
        /// Mission identifier.
        id: MissionId,
    },

    /// Re-queue a failed mission, keeping finished chunks.
    Retry {
        /// Mission identifier.
        id: MissionId,
    },

    /// Remove a mission; with --delete-file also its data.
    Remove {
        /// Mission identifier.
        id: MissionId,
        /// Delete the partial file (and the finished file, if any).
        #[arg(long)]
        delete_file: bool,
    },

    /// Drop the records of finished missions. Files are kept.
    Forget,

    /// Print shell completions to stdout.
    Completions {
        /// Target shell.
        shell: Shell,
    },

    /// Print the man page (roff) to stdout.
    Man,
}

impl CliCommand {
    pub async fn run_from_args() -> Result<()> {
        let cli = Cli::parse();

        // Neither needs config or the database.
        match cli.command {
            CliCommand::Completions { shell } => return run_completions(Cli::command(), shell),
            CliCommand::Man => return run_man(Cli::command()),
            _ => {}
        }

        let cfg = config::load_or_init()?;
        tracing::debug!("loaded config: {:?}", cfg);

        match cli.command {
            CliCommand::Add {
                urls,
                dir,
                name,
                block_size,
            } => {
                let cwd = std::env::current_dir()?;
                let dir = match dir {
                    Some(dir) => cwd.join(dir),
                    None => cwd,
                };
                let engine = open_engine(cfg, false).await?;
                run_add(&engine, urls, dir, name.unwrap_or_default(), block_size).await?;
            }
            CliCommand::Run => run_engine(open_engine(cfg, true).await?).await?,
            CliCommand::Status => run_status(&open_engine(cfg, false).await?),
            CliCommand::Pause { id } => run_control(cfg, ControlAction::Pause, id).await?,
            CliCommand::Resume { id } => run_control(cfg, ControlAction::Resume, id).await?,
            CliCommand::Retry { id } => run_control(cfg, ControlAction::Retry, id).await?,
            CliCommand::Remove { id, delete_file } => {
                let action = if delete_file {
                    ControlAction::RemoveAndDelete
                } else {
                    ControlAction::Remove
                };
                run_control(cfg, action, id).await?;
            }
            CliCommand::Forget => run_forget(&open_engine(cfg, false).await?).await?,
            CliCommand::Completions { .. } | CliCommand::Man => {}
        }

        Ok(())
    }
}

/// Opens the engine on the default database. With `autostart` off the queue
/// is only edited, nothing is downloaded.
pub(crate) async fn open_engine(cfg: EngineConfig, autostart: bool) -> Result<DownloadEngine> {
    let store = SqliteMissionStore::open_default().await?;
    EngineBuilder::new(cfg, Arc::new(store))
        .autostart(autostart)
        .open()
        .await
        .context("could not load missions")
}

#[cfg(test)]
mod tests;
