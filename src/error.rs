use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("interface error: {0}")]
    Interface(String),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Handoff(#[from] HandoffError),

    #[error("protocol engine error: {0}")]
    ProtocolEngine(String),

    #[error("resource already closed")]
    Closed,

    #[error("start cancelled by stop request")]
    Cancelled,

    #[error("invalid profile: {0}")]
    InvalidProfile(String),

    #[error("no profile selected -- run `h2tun profile select <name>` first")]
    NoProfileSelected,

    #[error("profile {0:?} not found")]
    ProfileNotFound(String),

    #[error("{0}")]
    Other(String),
}

/// The relay executable could not be launched.
#[derive(Debug, Error)]
#[error("failed to spawn {}: {source}", program.display())]
pub struct SpawnError {
    pub program: PathBuf,
    #[source]
    pub source: io::Error,
}

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("descriptor handoff failed after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: io::Error },

    #[error("descriptor handoff aborted after {attempts} attempts: tunnel stopped")]
    Aborted { attempts: u32 },
}

pub type Result<T> = std::result::Result<T, AppError>;
