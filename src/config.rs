//! Configuration loading and job validation.
//!
//! Settings are layered with figment: serde defaults, then the system file, then an
//! optional user file, then `BKROTATE_*` environment variables, then command-line
//! overrides. Job lists from several files are concatenated in file order.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::core::models::{MountSource, MountSpec, RotationStrategy};
use crate::error::ConfigError;

pub const SYSTEM_CONFIG_PATH: &str = "/etc/bkrotate/config.toml";

const DEFAULT_HISTORY_PATH: &str = "/var/cache/bkrotate/history.toml";
const DEFAULT_MOUNT_TABLE: &str = "/proc/mounts";
const DEFAULT_FREQUENCY_SECONDS: i64 = 60 * 60 * 24;
const DEFAULT_LINK_NAME: &str = "current";
const DEFAULT_FOLDER_PREFIX: &str = "backup-";

const ENV_KEYS: &[&str] = &[
    "history_file",
    "log_file",
    "verbose",
    "json_logs",
    "mount_table",
    "rsync_binary",
    "mount_binary",
    "umount_binary",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Where last-success timestamps are persisted between runs.
    pub history_file: PathBuf,
    pub log_file: Option<PathBuf>,
    pub verbose: bool,
    pub json_logs: bool,
    /// Live mount table consulted before mounting.
    pub mount_table: PathBuf,
    pub rsync_binary: PathBuf,
    pub mount_binary: PathBuf,
    pub umount_binary: PathBuf,
    /// Options applied to every job that does not set them itself.
    pub defaults: JobOptions,
    pub jobs: Vec<JobSection>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            history_file: PathBuf::from(DEFAULT_HISTORY_PATH),
            log_file: None,
            verbose: false,
            json_logs: false,
            mount_table: PathBuf::from(DEFAULT_MOUNT_TABLE),
            rsync_binary: PathBuf::from("rsync"),
            mount_binary: PathBuf::from("mount"),
            umount_binary: PathBuf::from("umount"),
            defaults: JobOptions::default(),
            jobs: Vec::new(),
        }
    }
}

/// Job options as written in a config file. Every field may be left out.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    pub mount_point: Option<PathBuf>,
    #[serde(alias = "UUID")]
    pub uuid: Option<String>,
    pub partition_label: Option<String>,
    pub partition_device: Option<PathBuf>,
    pub backup_folder: Option<PathBuf>,
    pub to_backup: Option<PathBuf>,
    pub backup_type: Option<RotationStrategy>,
    pub exclude_file: Option<PathBuf>,
    pub copy_log_file: Option<PathBuf>,
    pub link_name: Option<String>,
    pub folder_prefix: Option<String>,
    pub frequency_seconds: Option<i64>,
    pub rebase_root: Option<bool>,
    pub cross_filesystems: Option<bool>,
}

impl JobOptions {
    fn merged(&self, defaults: &JobOptions) -> JobOptions {
        JobOptions {
            mount_point: self.mount_point.clone().or_else(|| defaults.mount_point.clone()),
            uuid: self.uuid.clone().or_else(|| defaults.uuid.clone()),
            partition_label: self
                .partition_label
                .clone()
                .or_else(|| defaults.partition_label.clone()),
            partition_device: self
                .partition_device
                .clone()
                .or_else(|| defaults.partition_device.clone()),
            backup_folder: self
                .backup_folder
                .clone()
                .or_else(|| defaults.backup_folder.clone()),
            to_backup: self.to_backup.clone().or_else(|| defaults.to_backup.clone()),
            backup_type: self.backup_type.or(defaults.backup_type),
            exclude_file: self.exclude_file.clone().or_else(|| defaults.exclude_file.clone()),
            copy_log_file: self
                .copy_log_file
                .clone()
                .or_else(|| defaults.copy_log_file.clone()),
            link_name: self.link_name.clone().or_else(|| defaults.link_name.clone()),
            folder_prefix: self
                .folder_prefix
                .clone()
                .or_else(|| defaults.folder_prefix.clone()),
            frequency_seconds: self.frequency_seconds.or(defaults.frequency_seconds),
            rebase_root: self.rebase_root.or(defaults.rebase_root),
            cross_filesystems: self.cross_filesystems.or(defaults.cross_filesystems),
        }
    }
}

/// One `[[jobs]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct JobSection {
    pub name: String,
    #[serde(flatten)]
    pub options: JobOptions,
}

/// A validated, normalized backup job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfig {
    pub name: String,
    pub source: PathBuf,
    pub destination_root: PathBuf,
    pub mount: Option<MountSpec>,
    pub strategy: RotationStrategy,
    pub exclude_file: Option<PathBuf>,
    pub copy_log_file: Option<PathBuf>,
    pub link_name: String,
    pub folder_prefix: String,
    pub frequency_seconds: u64,
    pub rebase_root: bool,
    pub cross_filesystems: bool,
}

impl AppConfig {
    /// Load configuration from the given files (missing files are skipped), the
    /// environment, and optional serialized command-line overrides.
    pub fn load<T: Serialize>(files: &[PathBuf], overrides: Option<&T>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new();
        for file in files {
            figment = figment.admerge(Toml::file(file));
        }
        figment = figment.merge(Env::prefixed("BKROTATE_").only(ENV_KEYS));
        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        figment.extract().map_err(|e| ConfigError::Load(Box::new(e)))
    }

    /// Validate every configured job, in configuration order.
    pub fn job_configs(&self) -> Result<Vec<JobConfig>, ConfigError> {
        let mut seen = HashSet::new();
        let mut jobs = Vec::with_capacity(self.jobs.len());

        for section in &self.jobs {
            let job = section.validate(&self.defaults)?;
            if !seen.insert(job.name.clone()) {
                return Err(ConfigError::DuplicateJob(job.name));
            }
            jobs.push(job);
        }

        Ok(jobs)
    }
}

impl JobSection {
    pub fn validate(&self, defaults: &JobOptions) -> Result<JobConfig, ConfigError> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(ConfigError::invalid("<unnamed>", "job name must not be empty"));
        }

        let opts = self.options.merged(defaults);
        let identified_by = mount_source(&opts);

        let source = non_empty_path(opts.to_backup).ok_or_else(|| {
            ConfigError::invalid(name, "the directory to back up ('to_backup') must be given")
        })?;
        if !source.is_absolute() {
            return Err(ConfigError::invalid(
                name,
                "the directory to back up ('to_backup') must be an absolute path",
            ));
        }
        let source = normalize(&source);

        let mount_point = non_empty_path(opts.mount_point);
        if let Some(mount_point) = &mount_point {
            if !mount_point.is_absolute() {
                return Err(ConfigError::invalid(
                    name,
                    "the mount point ('mount_point') must be an absolute path",
                ));
            }
        }

        let backup_folder = non_empty_path(opts.backup_folder)
            .or_else(|| mount_point.clone())
            .ok_or_else(|| {
                ConfigError::invalid(
                    name,
                    "the directory where backups are stored ('backup_folder') must be given",
                )
            })?;

        let destination_root = match &mount_point {
            Some(mount_point) => normalize(&mount_point.join(&backup_folder)),
            None if backup_folder.is_absolute() => normalize(&backup_folder),
            None => {
                return Err(ConfigError::invalid(
                    name,
                    "no mount point is given, so 'backup_folder' must be an absolute path",
                ));
            }
        };
        if destination_root == source {
            return Err(ConfigError::invalid(
                name,
                "'backup_folder' must not be the directory being backed up",
            ));
        }

        let mount = match mount_point {
            Some(mount_point) => Some(MountSpec {
                mount_point: normalize(&mount_point),
                source: identified_by,
            }),
            None if identified_by != MountSource::Fstab => {
                return Err(ConfigError::invalid(
                    name,
                    "a partition identifier is given without a 'mount_point'",
                ));
            }
            None => None,
        };

        let frequency = opts.frequency_seconds.unwrap_or(DEFAULT_FREQUENCY_SECONDS);
        let frequency_seconds = u64::try_from(frequency).map_err(|_| {
            ConfigError::invalid(
                name,
                format!("'frequency_seconds' must be a non-negative integer, got {frequency}"),
            )
        })?;

        let link_name = opts
            .link_name
            .as_deref()
            .unwrap_or(DEFAULT_LINK_NAME)
            .trim_end_matches('/')
            .to_string();
        if !is_single_component(&link_name) {
            return Err(ConfigError::invalid(
                name,
                format!("'link_name' must be a plain file name, got '{link_name}'"),
            ));
        }

        let folder_prefix = opts
            .folder_prefix
            .unwrap_or_else(|| DEFAULT_FOLDER_PREFIX.to_string());
        if folder_prefix.contains('/') {
            return Err(ConfigError::invalid(
                name,
                "'folder_prefix' must not contain a path separator",
            ));
        }

        Ok(JobConfig {
            name: name.to_string(),
            source,
            destination_root,
            mount,
            strategy: opts.backup_type.unwrap_or(RotationStrategy::Incremental),
            exclude_file: non_empty_path(opts.exclude_file).map(|p| normalize(&p)),
            copy_log_file: non_empty_path(opts.copy_log_file).map(|p| normalize(&p)),
            link_name,
            folder_prefix,
            frequency_seconds,
            rebase_root: opts.rebase_root.unwrap_or(true),
            cross_filesystems: opts.cross_filesystems.unwrap_or(false),
        })
    }
}

/// Identification method in priority order: UUID, label, device, fstab.
fn mount_source(opts: &JobOptions) -> MountSource {
    if let Some(uuid) = non_empty(opts.uuid.as_deref()) {
        MountSource::Uuid(uuid.to_string())
    } else if let Some(label) = non_empty(opts.partition_label.as_deref()) {
        MountSource::Label(label.to_string())
    } else if let Some(device) = non_empty_path(opts.partition_device.clone()) {
        MountSource::Device(device)
    } else {
        MountSource::Fstab
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn non_empty_path(path: Option<PathBuf>) -> Option<PathBuf> {
    path.filter(|p| !p.as_os_str().is_empty())
}

/// Drop trailing separators and repeated slashes.
fn normalize(path: &Path) -> PathBuf {
    path.components().collect()
}

fn is_single_component(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && name != "." && name != ".."
}
