use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::transfer_engine::TransferStats;

/// How a new backup relates to the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationStrategy {
    /// New folder per run, unchanged files hardlinked against the previous run.
    Incremental,
    /// The previous folder becomes the new mirror; changed and removed files are
    /// archived into `<previous>_bak`.
    NoLinks,
    /// A single mirror kept directly in the destination root.
    Snapshot,
    /// New folder per run with an independent, complete copy.
    Full,
}

impl RotationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incremental => "incremental",
            Self::NoLinks => "nolinks",
            Self::Snapshot => "snapshot",
            Self::Full => "full",
        }
    }

    /// Whether runs produce dated folders and a `current` pointer.
    pub fn rotates(&self) -> bool {
        !matches!(self, Self::Snapshot)
    }
}

/// How the volume holding the backups is identified to the mount tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSource {
    Uuid(String),
    Label(String),
    Device(PathBuf),
    /// Rely on the system fstab entry for the mount point.
    Fstab,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub mount_point: PathBuf,
    pub source: MountSource,
}

/// What a successful rotation produced.
#[derive(Debug, Clone)]
pub struct BackupReport {
    /// Folder that now holds the newest backup (the destination root for snapshots).
    pub snapshot: PathBuf,
    pub stats: Option<TransferStats>,
}

/// Point-in-time view of a job's schedule, as printed by `bkrotate status`.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub name: String,
    pub strategy: RotationStrategy,
    pub destination: PathBuf,
    pub last_backup: Option<DateTime<Local>>,
    pub next_due: DateTime<Local>,
    pub due: bool,
}
