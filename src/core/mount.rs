//! Mounting the backup volume around a job.
//!
//! The volume is only unmounted afterwards if this run mounted it. [`VolumeMounter::mount`]
//! hands out a [`MountOutcome`] token recording that fact, and a [`MountGuard`] makes
//! sure the token is consumed even when the backup step fails.

use nix::unistd::Uid;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::core::models::{MountSource, MountSpec};
use crate::error::BackupError;

/// External mount/unmount commands.
pub trait MountTool {
    fn mount(&self, source: &MountSource, mount_point: &Path) -> Result<(), BackupError>;

    fn unmount(&self, mount_point: &Path) -> Result<(), BackupError>;
}

/// `mount(8)` and `umount(8)`.
pub struct SystemMountTool {
    mount_binary: PathBuf,
    umount_binary: PathBuf,
}

impl SystemMountTool {
    pub fn new(mount_binary: impl Into<PathBuf>, umount_binary: impl Into<PathBuf>) -> Self {
        Self {
            mount_binary: mount_binary.into(),
            umount_binary: umount_binary.into(),
        }
    }

    /// Arguments for mounting `source` at `mount_point`. Without an explicit
    /// identifier only the mount point is passed and mount(8) falls back to fstab.
    pub fn mount_args(source: &MountSource, mount_point: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::with_capacity(3);
        match source {
            MountSource::Uuid(uuid) => {
                args.push("-U".into());
                args.push(uuid.into());
            }
            MountSource::Label(label) => {
                args.push("-L".into());
                args.push(label.into());
            }
            MountSource::Device(device) => args.push(device.into()),
            MountSource::Fstab => {}
        }
        args.push(mount_point.into());
        args
    }
}

impl MountTool for SystemMountTool {
    fn mount(&self, source: &MountSource, mount_point: &Path) -> Result<(), BackupError> {
        let args = Self::mount_args(source, mount_point);
        debug!(binary = %self.mount_binary.display(), ?args, "Running mount");

        let status = Command::new(&self.mount_binary)
            .args(&args)
            .status()
            .map_err(|e| BackupError::Mount {
                mount_point: mount_point.to_path_buf(),
                reason: format!("failed to run {}: {}", self.mount_binary.display(), e),
            })?;

        if !status.success() {
            return Err(BackupError::Mount {
                mount_point: mount_point.to_path_buf(),
                reason: format!("{} exited with {}", self.mount_binary.display(), status),
            });
        }
        Ok(())
    }

    fn unmount(&self, mount_point: &Path) -> Result<(), BackupError> {
        debug!(binary = %self.umount_binary.display(), mount_point = %mount_point.display(), "Running umount");

        let status = Command::new(&self.umount_binary)
            .arg(mount_point)
            .status()
            .map_err(|e| BackupError::Unmount {
                mount_point: mount_point.to_path_buf(),
                reason: format!("failed to run {}: {}", self.umount_binary.display(), e),
            })?;

        if !status.success() {
            return Err(BackupError::Unmount {
                mount_point: mount_point.to_path_buf(),
                reason: format!("{} exited with {}", self.umount_binary.display(), status),
            });
        }
        Ok(())
    }
}

/// Whether this run has to unmount the volume again.
#[must_use = "dropping the outcome leaves a newly mounted volume mounted"]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountOutcome {
    /// Mounted before the job started, or nothing to mount.
    AlreadyMounted,
    NewlyMounted { mount_point: PathBuf },
}

pub struct VolumeMounter {
    tool: Box<dyn MountTool>,
    mount_table: PathBuf,
}

impl VolumeMounter {
    pub fn new(tool: Box<dyn MountTool>, mount_table: impl Into<PathBuf>) -> Self {
        Self {
            tool,
            mount_table: mount_table.into(),
        }
    }

    /// Mounter backed by the system mount tools named in the configuration.
    pub fn system(config: &AppConfig) -> Self {
        Self::new(
            Box::new(SystemMountTool::new(
                &config.mount_binary,
                &config.umount_binary,
            )),
            &config.mount_table,
        )
    }

    pub fn mount(&self, spec: Option<&MountSpec>) -> Result<MountOutcome, BackupError> {
        let Some(spec) = spec else {
            debug!("No mount point given, not mounting a volume");
            return Ok(MountOutcome::AlreadyMounted);
        };

        let mounted = is_mounted(&self.mount_table, &spec.mount_point).map_err(|e| {
            BackupError::Mount {
                mount_point: spec.mount_point.clone(),
                reason: format!(
                    "cannot read mount table {}: {}",
                    self.mount_table.display(),
                    e
                ),
            }
        })?;

        if mounted {
            info!(mount_point = %spec.mount_point.display(), "Volume is already mounted");
            return Ok(MountOutcome::AlreadyMounted);
        }

        if !Uid::effective().is_root() {
            warn!("Not running as root, mounting may be refused");
        }

        info!(
            mount_point = %spec.mount_point.display(),
            source = ?spec.source,
            "Mounting volume"
        );
        self.tool.mount(&spec.source, &spec.mount_point)?;
        info!(mount_point = %spec.mount_point.display(), "Volume mounted");

        Ok(MountOutcome::NewlyMounted {
            mount_point: spec.mount_point.clone(),
        })
    }

    pub fn unmount_if_needed(&self, outcome: MountOutcome) -> Result<(), BackupError> {
        let MountOutcome::NewlyMounted { mount_point } = outcome else {
            return Ok(());
        };

        info!(mount_point = %mount_point.display(), "Unmounting volume");
        nix::unistd::sync();
        self.tool.unmount(&mount_point)?;
        info!(mount_point = %mount_point.display(), "Volume unmounted");
        Ok(())
    }

    /// Tie `outcome` to a guard that unmounts on drop.
    pub fn guard(&self, outcome: MountOutcome) -> MountGuard<'_> {
        MountGuard {
            mounter: self,
            outcome: Some(outcome),
        }
    }
}

/// Releases a mount acquired by [`VolumeMounter::mount`].
///
/// Call [`MountGuard::release`] to observe unmount errors; if the guard is dropped
/// instead, the volume is still unmounted and failures are only logged.
pub struct MountGuard<'a> {
    mounter: &'a VolumeMounter,
    outcome: Option<MountOutcome>,
}

impl MountGuard<'_> {
    pub fn release(mut self) -> Result<(), BackupError> {
        match self.outcome.take() {
            Some(outcome) => self.mounter.unmount_if_needed(outcome),
            None => Ok(()),
        }
    }
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        if let Some(outcome) = self.outcome.take() {
            if let Err(e) = self.mounter.unmount_if_needed(outcome) {
                error!(error = %e, "Failed to unmount volume");
            }
        }
    }
}

/// Whether the mount table at `table` lists an entry mounted at `mount_point`.
pub fn is_mounted(table: &Path, mount_point: &Path) -> io::Result<bool> {
    let content = fs::read_to_string(table)?;
    Ok(mount_points(&content).any(|mp| Path::new(&mp) == mount_point))
}

/// Mount points listed in a `/proc/mounts` style table
/// (`device mount_point fstype options dump pass`).
fn mount_points(table: &str) -> impl Iterator<Item = String> + '_ {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(unescape_octal)
}

/// The kernel escapes whitespace and backslashes in mount points as `\ooo`.
fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        let is_escape = bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..=i + 3].iter().all(|b| (b'0'..=b'7').contains(b));
        if is_escape {
            if let Ok(value) = u8::from_str_radix(&field[i + 1..=i + 3], 8) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}
