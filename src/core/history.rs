//! Per-job record of the last successful backup.
//!
//! The store is read once when a run starts and written back once when it ends.
//! A crash in between loses the records of the jobs that finished in that run, so
//! those jobs run again next time.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::HistoryError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct HistoryRecord {
    last_backup: i64,
}

#[derive(Debug)]
pub struct HistoryStore {
    path: PathBuf,
    records: BTreeMap<String, HistoryRecord>,
}

impl HistoryStore {
    /// Read the history file at `path`. A missing file is an empty history.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, HistoryError> {
        let path = path.into();

        let records = match fs::read_to_string(&path) {
            Ok(content) => toml::from_str(&content).map_err(|source| HistoryError::Parse {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No history file yet");
                BTreeMap::new()
            }
            Err(source) => return Err(HistoryError::Read { path, source }),
        };

        Ok(Self { path, records })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unix timestamp of the job's last success, 0 if it never succeeded.
    pub fn last_run(&self, job: &str) -> i64 {
        self.records.get(job).map_or(0, |r| r.last_backup)
    }

    pub fn record_success(&mut self, job: &str, timestamp: i64) {
        self.records.insert(
            job.to_string(),
            HistoryRecord {
                last_backup: timestamp,
            },
        );
    }

    /// A job is due when forced or when strictly more than `frequency_seconds`
    /// have passed since its last success.
    pub fn is_due(&self, job: &str, frequency_seconds: u64, now: i64, force: bool) -> bool {
        force || is_stale(self.last_run(job), frequency_seconds, now)
    }

    /// Write all records, including those of jobs no longer configured.
    pub fn flush(&self) -> Result<(), HistoryError> {
        let content = toml::to_string(&self.records)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| HistoryError::Write {
                path: self.path.clone(),
                source,
            })?;
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, content)
            .and_then(|_| fs::rename(&tmp, &self.path))
            .map_err(|source| HistoryError::Write {
                path: self.path.clone(),
                source,
            })?;

        debug!(path = %self.path.display(), records = self.records.len(), "History written");
        Ok(())
    }
}

pub fn is_stale(last_run: i64, frequency_seconds: u64, now: i64) -> bool {
    let elapsed = i128::from(now) - i128::from(last_run);
    elapsed > i128::from(frequency_seconds)
}
