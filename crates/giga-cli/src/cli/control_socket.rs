//! Control socket: server (during `giga run`) and client (for `giga pause` etc.).
//! Protocol: one request line, one reply line. Requests are
//! "pause|resume|retry|remove|remove-delete <id>"; replies are "ok" or "err <reason>".

use std::fmt;
use std::path::Path;

use anyhow::{bail, Result};
use giga_core::{DownloadEngine, MissionId};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Pause,
    Resume,
    Retry,
    Remove,
    RemoveAndDelete,
}

impl ControlAction {
    fn verb(self) -> &'static str {
        match self {
            ControlAction::Pause => "pause",
            ControlAction::Resume => "resume",
            ControlAction::Retry => "retry",
            ControlAction::Remove => "remove",
            ControlAction::RemoveAndDelete => "remove-delete",
        }
    }

    fn from_verb(verb: &str) -> Option<Self> {
        Some(match verb {
            "pause" => ControlAction::Pause,
            "resume" => ControlAction::Resume,
            "retry" => ControlAction::Retry,
            "remove" => ControlAction::Remove,
            "remove-delete" => ControlAction::RemoveAndDelete,
            _ => return None,
        })
    }

    /// Applies the action to an engine.
    pub async fn apply(self, engine: &DownloadEngine, id: &MissionId) -> Result<()> {
        match self {
            ControlAction::Pause => engine.pause(id).await?,
            ControlAction::Resume => engine.resume(id).await?,
            ControlAction::Retry => engine.retry(id).await?,
            ControlAction::Remove => engine.cancel(id, false).await?,
            ControlAction::RemoveAndDelete => engine.cancel(id, true).await?,
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    pub action: ControlAction,
    pub id: MissionId,
}

impl ControlRequest {
    pub fn parse(line: &str) -> Option<Self> {
        let (verb, id) = line.trim().split_once(' ')?;
        Some(ControlRequest {
            action: ControlAction::from_verb(verb)?,
            id: id.parse().ok()?,
        })
    }
}

impl fmt::Display for ControlRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.action.verb(), self.id)
    }
}

/// Spawns a task that listens on `path` and applies each request to `engine`.
/// Malformed lines get an `err` reply.
pub fn spawn_control_listener(
    engine: DownloadEngine,
    path: impl AsRef<Path>,
) -> Result<tokio::task::JoinHandle<()>> {
    let path = path.as_ref().to_path_buf();
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path)?;
    let handle = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let engine = engine.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve(stream, &engine).await {
                            tracing::debug!("control connection: {}", e);
                        }
                    });
                }
                Err(e) => tracing::debug!("control socket accept: {}", e),
            }
        }
    });
    Ok(handle)
}

async fn serve(stream: UnixStream, engine: &DownloadEngine) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    while let Some(line) = lines.next_line().await? {
        let reply = match ControlRequest::parse(&line) {
            Some(req) => match req.action.apply(engine, &req.id).await {
                Ok(()) => {
                    tracing::info!(request = %req, "control request applied");
                    "ok".to_string()
                }
                Err(e) => format!("err {:#}", e),
            },
            None => format!("err malformed request {:?}", line.trim()),
        };
        write.write_all(reply.as_bytes()).await?;
        write.write_all(b"\n").await?;
    }
    Ok(())
}

/// Sends one request to a live `giga run`.
///
/// Returns `Ok(false)` when nothing is listening, so the caller can apply
/// the request to the database itself.
pub async fn send(socket_path: &Path, req: &ControlRequest) -> Result<bool> {
    if !socket_path.exists() {
        return Ok(false);
    }
    let stream = match UnixStream::connect(socket_path).await {
        Ok(s) => s,
        Err(e) => {
            tracing::debug!(path = %socket_path.display(), "control socket connect: {}", e);
            return Ok(false);
        }
    };
    let (read, mut write) = stream.into_split();
    write.write_all(format!("{}\n", req).as_bytes()).await?;
    write.shutdown().await?;
    let reply = BufReader::new(read).lines().next_line().await?;
    match reply.as_deref().map(str::trim) {
        Some("ok") => Ok(true),
        Some(other) => bail!("{}", other.strip_prefix("err ").unwrap_or(other)),
        None => bail!("control socket closed without a reply"),
    }
}
