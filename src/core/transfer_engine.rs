pub mod rsync;

use serde::Serialize;
use std::path::PathBuf;

use crate::error::BackupError;

pub use rsync::RsyncEngine;

/// One invocation of the copy tool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferRequest {
    /// Directory whose contents are copied.
    pub source: PathBuf,
    /// Directory the contents are copied into.
    pub destination: PathBuf,
    pub cross_filesystems: bool,
    /// Hardlink files that are unchanged relative to this directory.
    pub link_dest: Option<PathBuf>,
    /// Move replaced and deleted files into this directory.
    pub backup_dir: Option<PathBuf>,
    pub exclude_from: Option<PathBuf>,
    /// Patterns relative to the transfer root.
    pub excludes: Vec<String>,
    /// Remove destination files that no longer exist in the source.
    pub delete: bool,
    pub log_file: Option<PathBuf>,
}

/// Counters reported by the copy tool, when it reports any.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransferStats {
    pub files_transferred: u64,
    pub total_file_size: u64,
    pub transferred_file_size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct TransferResult {
    pub stats: Option<TransferStats>,
}

pub trait TransferEngine {
    /// Run the copy to completion. A failing tool is [`BackupError::CopyFailed`].
    fn transfer(&self, req: &TransferRequest) -> Result<TransferResult, BackupError>;
}
