//! `giga pause|resume|retry|remove <id>` – through the control socket of a
//! live `giga run` if there is one, otherwise straight on the database.

use anyhow::Result;
use giga_core::config::EngineConfig;
use giga_core::MissionId;

use crate::cli::control_socket::{self, ControlAction, ControlRequest};
use crate::cli::open_engine;

pub async fn run_control(cfg: EngineConfig, action: ControlAction, id: MissionId) -> Result<()> {
    let req = ControlRequest { action, id };
    if let Ok(path) = giga_core::control::default_control_socket_path() {
        if control_socket::send(&path, &req).await? {
            println!("{}: done (via running giga)", req);
            return Ok(());
        }
    }
    let engine = open_engine(cfg, false).await?;
    req.action.apply(&engine, &req.id).await?;
    println!("{}: done", req);
    Ok(())
}
