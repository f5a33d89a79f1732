use crate::types::ServerType;
use thiserror::Error;
use uuid::Uuid;

/// Errors returned by the supervisor and its collaborators.
#[derive(Error, Debug)]
pub enum ManagerError {
    /// No free port could be found at or above the requested one.
    #[error("port {0} is already in use")]
    PortInUse(u16),

    /// A download or build for the same engine/version is already running.
    #[error("already building {server_type} {version}")]
    AlreadyBuilding {
        server_type: ServerType,
        version: String,
    },

    #[error("server binary unavailable: {0}")]
    BinaryUnavailable(String),

    /// The operation is not allowed in the server's current status.
    #[error("{0}")]
    InvalidState(String),

    #[error("server {0} not found")]
    NotFound(Uuid),

    #[error("failed to spawn server process: {0}")]
    ProcessSpawn(String),

    #[error("no worlds to backup")]
    NoWorldsToBackup,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ManagerError>;
