use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DebloatError {
    #[error("I/O error while accessing settings {path:?}: {source}")]
    Persistence {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error("settings document {path:?} is invalid: {source}")]
    SettingsFormat {
        #[source]
        source: serde_json::Error,
        path: PathBuf,
    },

    #[error("app list unavailable at {path:?}")]
    ResourceUnavailable { path: PathBuf },

    #[error("failed to read app list {path:?}: {source}")]
    ReadFailed {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error("failed to write app list {path:?}: {source}")]
    WriteFailed {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error("unknown app list entry: {0}")]
    UnknownEntry(String),

    #[error("a debloat run is already in progress")]
    AlreadyRunning,

    #[error("no debloat run is in progress")]
    NotRunning,

    #[error("failed to launch {program:?}: {source}")]
    Launch {
        #[source]
        source: std::io::Error,
        program: PathBuf,
    },

    #[error("{0} requires administrative privileges")]
    PermissionDenied(String),
}

impl DebloatError {
    pub fn persistence(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        DebloatError::Persistence {
            source: err,
            path: path.into(),
        }
    }

    pub fn launch(program: impl Into<PathBuf>, err: std::io::Error) -> Self {
        DebloatError::Launch {
            source: err,
            program: program.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DebloatError>;
