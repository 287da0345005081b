//! Error types for bkrotate.
//!
//! Configuration problems are rejected before any job runs. Everything that can go
//! wrong while a single job runs is a [`BackupError`]; the orchestrator logs it and
//! moves on to the next job. Only [`HistoryError`] aborts a whole run.

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("job '{job}': {reason}")]
    InvalidJob { job: String, reason: String },

    #[error("job '{0}' is defined more than once")]
    DuplicateJob(String),
}

impl ConfigError {
    pub(crate) fn invalid(job: &str, reason: impl Into<String>) -> Self {
        Self::InvalidJob {
            job: job.to_string(),
            reason: reason.into(),
        }
    }
}

/// The step of a job an error happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Mount,
    Rotate,
    Copy,
    Unmount,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Mount => write!(f, "mount"),
            Phase::Rotate => write!(f, "rotate"),
            Phase::Copy => write!(f, "copy"),
            Phase::Unmount => write!(f, "unmount"),
        }
    }
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("mounting {mount_point} failed: {reason}")]
    Mount { mount_point: PathBuf, reason: String },

    #[error("unmounting {mount_point} failed: {reason}")]
    Unmount { mount_point: PathBuf, reason: String },

    #[error("copy failed: {0}")]
    CopyFailed(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("backup destination {0} is the source directory itself")]
    DestinationIsSource(PathBuf),
}

impl BackupError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            BackupError::Mount { .. } => Phase::Mount,
            BackupError::Unmount { .. } => Phase::Unmount,
            BackupError::CopyFailed(_) => Phase::Copy,
            BackupError::Io { .. } | BackupError::DestinationIsSource(_) => Phase::Rotate,
        }
    }
}

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("failed to read history file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse history file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to serialize history: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("failed to write history file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
