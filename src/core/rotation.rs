//! The backup rotation engine.
//!
//! Every run of a rotating strategy gets a new dated folder under the destination
//! root, and on success the `current` link is moved to it. Strategies differ only in
//! the hints handed to the copy tool and in what happens to the previous folder:
//!
//! - incremental: unchanged files are hardlinked against the previous folder
//! - full: a complete, independent copy
//! - nolinks: the previous folder is renamed to become the new one, and files it
//!   held that changed or disappeared are moved into a fresh `<previous>_bak`
//! - snapshot: no folders at all, the destination root is a single mirror
//!
//! A failed copy leaves the destination as it is. In particular a nolinks rotation is
//! not undone, and `current` then points at a name that no longer exists.

use chrono::{DateTime, Local};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::JobConfig;
use crate::core::clock::Clock;
use crate::core::models::{BackupReport, RotationStrategy};
use crate::core::transfer_engine::{TransferEngine, TransferRequest};
use crate::error::BackupError;

const FOLDER_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M";
const ARCHIVE_SUFFIX: &str = "_bak";

/// Copy hints chosen by a strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CopyPlan {
    Incremental { link_dest: Option<PathBuf> },
    Full,
    NoLinks { backup_dir: Option<PathBuf> },
    Snapshot,
}

impl CopyPlan {
    fn apply(self, req: &mut TransferRequest) {
        match self {
            CopyPlan::Incremental { link_dest } => req.link_dest = link_dest,
            CopyPlan::Full => {}
            CopyPlan::NoLinks { backup_dir } => {
                // Removed files go to the archive too, so the new folder stays an exact mirror.
                req.delete = backup_dir.is_some();
                req.backup_dir = backup_dir;
            }
            CopyPlan::Snapshot => req.delete = true,
        }
    }
}

pub struct RotationEngine<'a> {
    transfer: &'a dyn TransferEngine,
    clock: &'a dyn Clock,
}

impl<'a> RotationEngine<'a> {
    pub fn new(transfer: &'a dyn TransferEngine, clock: &'a dyn Clock) -> Self {
        Self { transfer, clock }
    }

    /// The folder the job's `current` link resolves to, if it is an existing directory.
    pub fn previous_snapshot(job: &JobConfig) -> Option<PathBuf> {
        if !job.strategy.rotates() {
            return None;
        }

        let link = job.destination_root.join(&job.link_name);
        if !link.is_dir() {
            debug!(link = %link.display(), "No previous backup");
            return None;
        }
        fs::canonicalize(&link).ok()
    }

    pub fn run(&self, job: &JobConfig, previous: Option<&Path>) -> Result<BackupReport, BackupError> {
        fs::create_dir_all(&job.destination_root).map_err(|e| {
            BackupError::io(
                format!(
                    "failed to create backup destination {}",
                    job.destination_root.display()
                ),
                e,
            )
        })?;

        let (snapshot, plan) = match job.strategy {
            RotationStrategy::Snapshot => (job.destination_root.clone(), CopyPlan::Snapshot),
            RotationStrategy::Full => (self.allocate(job)?, CopyPlan::Full),
            RotationStrategy::Incremental => {
                let folder = self.allocate(job)?;
                let link_dest = previous.and_then(|prev| reuse_hint(job, prev));
                (folder, CopyPlan::Incremental { link_dest })
            }
            RotationStrategy::NoLinks => {
                let folder = self.allocate(job)?;
                let backup_dir = previous
                    .map(|prev| rotate_previous(job, prev, &folder))
                    .transpose()?;
                (folder, CopyPlan::NoLinks { backup_dir })
            }
        };

        let destination = match plan {
            CopyPlan::Snapshot => snapshot.clone(),
            _ => target_dir(job, &snapshot),
        };
        fs::create_dir_all(&destination).map_err(|e| {
            BackupError::io(
                format!("failed to create {}", destination.display()),
                e,
            )
        })?;

        let (exclude_from, excludes) = exclusions(job)?;
        let mut req = TransferRequest {
            source: job.source.clone(),
            destination,
            cross_filesystems: job.cross_filesystems,
            exclude_from,
            excludes,
            log_file: copy_log_file(job),
            ..Default::default()
        };
        plan.apply(&mut req);

        let result = self.transfer.transfer(&req)?;

        if job.strategy.rotates() {
            replace_link(&job.destination_root, &job.link_name, &snapshot)?;
            debug!(link = %job.link_name, target = %snapshot.display(), "Pointer updated");
        }

        info!(snapshot = %snapshot.display(), "Backup succeeded");
        Ok(BackupReport {
            snapshot,
            stats: result.stats,
        })
    }

    fn allocate(&self, job: &JobConfig) -> Result<PathBuf, BackupError> {
        let folder = allocate_folder(&job.destination_root, &job.folder_prefix, self.clock.now())?;
        info!(folder = %folder.display(), "New backup folder");
        Ok(folder)
    }
}

/// Create `<root>/<prefix><timestamp>`, appending `_1`, `_2`, ... until the name is free.
pub fn allocate_folder(root: &Path, prefix: &str, now: DateTime<Local>) -> Result<PathBuf, BackupError> {
    let base = format!("{}{}", prefix, now.format(FOLDER_TIMESTAMP_FORMAT));
    create_unique_dir(root, &base)
}

fn create_unique_dir(root: &Path, base: &str) -> Result<PathBuf, BackupError> {
    let mut attempt: u32 = 0;

    loop {
        let name = match attempt {
            0 => base.to_string(),
            n => format!("{base}_{n}"),
        };
        let path = root.join(name);

        match fs::create_dir(&path) {
            Ok(()) => return Ok(path),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => attempt += 1,
            Err(e) => {
                return Err(BackupError::io(
                    format!("failed to create backup folder {}", path.display()),
                    e,
                ));
            }
        }
    }
}

/// Where the copy lands inside `base`: the source's absolute path is reproduced
/// below `base` when the job rebases the root.
pub fn target_dir(job: &JobConfig, base: &Path) -> PathBuf {
    if !job.rebase_root {
        return base.to_path_buf();
    }
    match job.source.strip_prefix("/") {
        Ok(relative) if !relative.as_os_str().is_empty() => base.join(relative),
        _ => base.to_path_buf(),
    }
}

/// Path of `destination` relative to `source` when it lies inside it. Both are
/// resolved through symlinks first.
pub fn nested_destination(source: &Path, destination: &Path) -> Result<Option<PathBuf>, BackupError> {
    let source = fs::canonicalize(source)
        .map_err(|e| BackupError::io(format!("cannot resolve source {}", source.display()), e))?;
    let destination = fs::canonicalize(destination).map_err(|e| {
        BackupError::io(
            format!("cannot resolve destination {}", destination.display()),
            e,
        )
    })?;

    match destination.strip_prefix(&source) {
        Ok(relative) if relative.as_os_str().is_empty() => {
            Err(BackupError::DestinationIsSource(destination))
        }
        Ok(relative) => Ok(Some(relative.to_path_buf())),
        Err(_) => Ok(None),
    }
}

fn reuse_hint(job: &JobConfig, previous: &Path) -> Option<PathBuf> {
    let link_dest = target_dir(job, previous);
    if link_dest.is_dir() {
        Some(link_dest)
    } else {
        warn!(
            previous = %link_dest.display(),
            "Previous backup has no copy of the source, not hardlinking"
        );
        None
    }
}

/// Turn the previous folder into the new one and create its archive folder.
/// Returns the directory that receives replaced and deleted files.
fn rotate_previous(job: &JobConfig, previous: &Path, folder: &Path) -> Result<PathBuf, BackupError> {
    fs::remove_dir(folder).map_err(|e| {
        BackupError::io(format!("failed to remove {}", folder.display()), e)
    })?;
    fs::rename(previous, folder).map_err(|e| {
        BackupError::io(
            format!(
                "failed to move {} to {}",
                previous.display(),
                folder.display()
            ),
            e,
        )
    })?;

    // Folder names recur when several runs share a minute, so an older archive
    // may already hold the plain `_bak` name.
    let (parent, name) = match (previous.parent(), previous.file_name()) {
        (Some(parent), Some(name)) => (parent, name.to_string_lossy()),
        _ => {
            return Err(BackupError::io(
                format!("cannot archive {}", previous.display()),
                std::io::Error::from(ErrorKind::InvalidInput),
            ));
        }
    };
    let archive = create_unique_dir(parent, &format!("{name}{ARCHIVE_SUFFIX}"))?;

    let backup_dir = target_dir(job, &archive);
    fs::create_dir_all(&backup_dir).map_err(|e| {
        BackupError::io(format!("failed to create {}", backup_dir.display()), e)
    })?;

    info!(
        previous = %previous.display(),
        folder = %folder.display(),
        archive = %archive.display(),
        "Rotated previous backup"
    );
    Ok(backup_dir)
}

fn exclusions(job: &JobConfig) -> Result<(Option<PathBuf>, Vec<String>), BackupError> {
    let exclude_from = match &job.exclude_file {
        Some(file) if file.exists() => Some(file.clone()),
        Some(file) => {
            warn!(exclude_file = %file.display(), "Exclude file does not exist, ignoring it");
            None
        }
        None => None,
    };

    let mut excludes = Vec::new();
    if let Some(relative) = nested_destination(&job.source, &job.destination_root)? {
        // Anchored at the transfer root, directories only
        let pattern = format!("/{}/", escape_pattern(&relative.to_string_lossy()));
        debug!(pattern = %pattern, "Excluding backup destination inside the source");
        excludes.push(pattern);
    }

    Ok((exclude_from, excludes))
}

/// rsync reads `*`, `?` and `[` as wildcards. Once a pattern has one, a backslash
/// escapes the next character; without any, backslashes are literal.
fn escape_pattern(path: &str) -> String {
    if !path.contains(['*', '?', '[']) {
        return path.to_string();
    }
    let mut escaped = String::with_capacity(path.len() + 4);
    for c in path.chars() {
        if matches!(c, '*' | '?' | '[' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn copy_log_file(job: &JobConfig) -> Option<PathBuf> {
    let log_file = job.copy_log_file.as_ref()?;
    match log_file.parent() {
        Some(parent) if parent.is_dir() => Some(log_file.clone()),
        _ => {
            warn!(log_file = %log_file.display(), "Directory of the copy log file does not exist, not logging");
            None
        }
    }
}

/// Point `<root>/<link_name>` at `snapshot` using a path relative to `root`.
///
/// The link is created under a temporary name and renamed over the old one, so
/// there is never a moment without a pointer.
fn replace_link(root: &Path, link_name: &str, snapshot: &Path) -> Result<(), BackupError> {
    let target = snapshot.strip_prefix(root).unwrap_or(snapshot);
    let link = root.join(link_name);
    let tmp = root.join(format!(".{link_name}.tmp"));

    match fs::remove_file(&tmp) {
        Err(e) if e.kind() != ErrorKind::NotFound => {
            return Err(BackupError::io(
                format!("failed to remove stale link {}", tmp.display()),
                e,
            ));
        }
        _ => {}
    }

    symlink(target, &tmp)
        .map_err(|e| BackupError::io(format!("failed to create link {}", tmp.display()), e))?;
    fs::rename(&tmp, &link)
        .map_err(|e| BackupError::io(format!("failed to replace link {}", link.display()), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::FixedClock;
    use crate::core::transfer_engine::TransferResult;
    use chrono::TimeZone;
    use std::sync::Mutex;
    use tempfile::{TempDir, tempdir};

    #[derive(Default)]
    struct RecordingTransfer {
        requests: Mutex<Vec<TransferRequest>>,
        fail: bool,
    }

    impl RecordingTransfer {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        fn last(&self) -> TransferRequest {
            self.requests.lock().unwrap().last().cloned().unwrap()
        }
    }

    impl TransferEngine for RecordingTransfer {
        fn transfer(&self, req: &TransferRequest) -> Result<TransferResult, BackupError> {
            self.requests.lock().unwrap().push(req.clone());
            if self.fail {
                return Err(BackupError::CopyFailed("rsync exited with exit status: 23".to_string()));
            }
            Ok(TransferResult::default())
        }
    }

    fn clock() -> FixedClock {
        FixedClock(Local.with_ymd_and_hms(2024, 3, 5, 14, 7, 0).unwrap())
    }

    struct Fixture {
        _temp: TempDir,
        source: PathBuf,
        root: PathBuf,
    }

    fn fixture() -> Fixture {
        let temp = tempdir().unwrap();
        let source = temp.path().join("orig");
        let root = temp.path().join("backup");
        fs::create_dir_all(source.join("dir")).unwrap();
        fs::write(source.join("a"), "X").unwrap();
        fs::write(source.join("dir/b"), "Y").unwrap();
        Fixture {
            _temp: temp,
            source,
            root,
        }
    }

    fn job(fx: &Fixture, strategy: RotationStrategy) -> JobConfig {
        JobConfig {
            name: "testing".to_string(),
            source: fx.source.clone(),
            destination_root: fx.root.clone(),
            mount: None,
            strategy,
            exclude_file: None,
            copy_log_file: None,
            link_name: "current".to_string(),
            folder_prefix: "backup-".to_string(),
            frequency_seconds: 0,
            rebase_root: false,
            cross_filesystems: false,
        }
    }

    #[test]
    fn test_folder_names_and_collisions() {
        let temp = tempdir().unwrap();
        let now = clock().0;

        let first = allocate_folder(temp.path(), "backup-", now).unwrap();
        let second = allocate_folder(temp.path(), "backup-", now).unwrap();
        let third = allocate_folder(temp.path(), "backup-", now).unwrap();

        assert_eq!(first.file_name().unwrap(), "backup-2024-03-05T14:07");
        assert_eq!(second.file_name().unwrap(), "backup-2024-03-05T14:07_1");
        assert_eq!(third.file_name().unwrap(), "backup-2024-03-05T14:07_2");
        assert!(third.is_dir());
    }

    #[test]
    fn test_target_dir_rebases_source_path() {
        let fx = fixture();
        let mut job = job(&fx, RotationStrategy::Incremental);
        let base = Path::new("/srv/backup/backup-x");

        assert_eq!(target_dir(&job, base), base);

        job.rebase_root = true;
        job.source = PathBuf::from("/home/user");
        assert_eq!(target_dir(&job, base), Path::new("/srv/backup/backup-x/home/user"));

        job.source = PathBuf::from("/");
        assert_eq!(target_dir(&job, base), base);
    }

    #[test]
    fn test_first_incremental_run() {
        let fx = fixture();
        let job = job(&fx, RotationStrategy::Incremental);
        let transfer = RecordingTransfer::default();
        let clock = clock();
        let engine = RotationEngine::new(&transfer, &clock);

        assert_eq!(RotationEngine::previous_snapshot(&job), None);
        let report = engine.run(&job, None).unwrap();

        let req = transfer.last();
        assert_eq!(req.source, fx.source);
        assert_eq!(req.destination, report.snapshot);
        assert_eq!(req.link_dest, None);
        assert!(!req.delete);
        assert!(!req.cross_filesystems);

        let link = fs::read_link(fx.root.join("current")).unwrap();
        assert_eq!(link, Path::new("backup-2024-03-05T14:07"));
        assert_eq!(
            RotationEngine::previous_snapshot(&job),
            Some(fs::canonicalize(&report.snapshot).unwrap())
        );
    }

    #[test]
    fn test_incremental_links_against_previous() {
        let fx = fixture();
        let job = job(&fx, RotationStrategy::Incremental);
        let transfer = RecordingTransfer::default();
        let clock = clock();
        let engine = RotationEngine::new(&transfer, &clock);

        let first = engine.run(&job, None).unwrap();
        let previous = RotationEngine::previous_snapshot(&job).unwrap();
        let second = engine.run(&job, Some(&previous)).unwrap();

        assert_ne!(first.snapshot, second.snapshot);
        assert_eq!(transfer.last().link_dest, Some(previous));
        assert_eq!(
            fs::read_link(fx.root.join("current")).unwrap(),
            Path::new("backup-2024-03-05T14:07_1")
        );
        assert!(first.snapshot.is_dir());
    }

    #[test]
    fn test_incremental_hint_follows_rebase() {
        let fx = fixture();
        let mut job = job(&fx, RotationStrategy::Incremental);
        job.rebase_root = true;
        let transfer = RecordingTransfer::default();
        let clock = clock();
        let engine = RotationEngine::new(&transfer, &clock);

        let first = engine.run(&job, None).unwrap();
        let rebased = target_dir(&job, &first.snapshot);
        assert_eq!(transfer.last().destination, rebased);
        assert!(rebased.is_dir());

        let previous = RotationEngine::previous_snapshot(&job).unwrap();
        engine.run(&job, Some(&previous)).unwrap();
        assert_eq!(transfer.last().link_dest, Some(target_dir(&job, &previous)));
    }

    #[test]
    fn test_full_never_links() {
        let fx = fixture();
        let job = job(&fx, RotationStrategy::Full);
        let transfer = RecordingTransfer::default();
        let clock = clock();
        let engine = RotationEngine::new(&transfer, &clock);

        engine.run(&job, None).unwrap();
        let previous = RotationEngine::previous_snapshot(&job).unwrap();
        engine.run(&job, Some(&previous)).unwrap();

        let req = transfer.last();
        assert_eq!(req.link_dest, None);
        assert_eq!(req.backup_dir, None);
        assert!(!req.delete);
    }

    #[test]
    fn test_nolinks_rotates_previous_folder() {
        let fx = fixture();
        let job = job(&fx, RotationStrategy::NoLinks);
        let transfer = RecordingTransfer::default();
        let clock = clock();
        let engine = RotationEngine::new(&transfer, &clock);

        let first = engine.run(&job, None).unwrap();
        assert_eq!(transfer.last().backup_dir, None);
        fs::write(first.snapshot.join("a"), "X").unwrap();

        let previous = RotationEngine::previous_snapshot(&job).unwrap();
        let second = engine.run(&job, Some(&previous)).unwrap();

        // The old folder now lives under the new name, with its content.
        assert!(!previous.exists());
        assert_eq!(fs::read_to_string(second.snapshot.join("a")).unwrap(), "X");

        let archive = fx.root.join("backup-2024-03-05T14:07_bak");
        assert!(archive.is_dir());
        let req = transfer.last();
        assert_eq!(req.destination, second.snapshot);
        assert_eq!(req.backup_dir.as_deref(), Some(fs::canonicalize(&archive).unwrap().as_path()));
        assert!(req.delete);
        assert_eq!(
            fs::read_link(fx.root.join("current")).unwrap(),
            Path::new("backup-2024-03-05T14:07_1")
        );
    }

    /// Moves a file into the archive directory the way `rsync -b` does, and records
    /// whether that directory was still empty when the copy started.
    #[derive(Default)]
    struct ArchivingTransfer {
        archives: Mutex<Vec<(PathBuf, bool)>>,
    }

    impl TransferEngine for ArchivingTransfer {
        fn transfer(&self, req: &TransferRequest) -> Result<TransferResult, BackupError> {
            if let Some(backup_dir) = &req.backup_dir {
                let empty = fs::read_dir(backup_dir).unwrap().next().is_none();
                fs::write(backup_dir.join("a"), "old").unwrap();
                self.archives
                    .lock()
                    .unwrap()
                    .push((backup_dir.clone(), empty));
            }
            Ok(TransferResult::default())
        }
    }

    #[test]
    fn test_nolinks_archive_is_fresh_within_one_minute() {
        let fx = fixture();
        let job = job(&fx, RotationStrategy::NoLinks);
        let transfer = ArchivingTransfer::default();
        let clock = clock();
        let engine = RotationEngine::new(&transfer, &clock);

        for _ in 0..4 {
            let previous = RotationEngine::previous_snapshot(&job);
            engine.run(&job, previous.as_deref()).unwrap();
        }

        let archives = transfer.archives.lock().unwrap().clone();
        assert_eq!(archives.len(), 3);
        assert!(archives.iter().all(|(_, empty)| *empty), "{archives:?}");

        let mut names: Vec<_> = archives
            .iter()
            .map(|(dir, _)| dir.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names.dedup();
        assert_eq!(
            names,
            [
                "backup-2024-03-05T14:07_1_bak",
                "backup-2024-03-05T14:07_bak",
                "backup-2024-03-05T14:07_bak_1",
            ]
        );
    }

    #[test]
    fn test_nolinks_archive_follows_rebase() {
        let fx = fixture();
        let mut job = job(&fx, RotationStrategy::NoLinks);
        job.rebase_root = true;
        let transfer = RecordingTransfer::default();
        let clock = clock();
        let engine = RotationEngine::new(&transfer, &clock);

        engine.run(&job, None).unwrap();
        let previous = RotationEngine::previous_snapshot(&job).unwrap();
        let second = engine.run(&job, Some(&previous)).unwrap();

        let mut archive = previous.as_os_str().to_os_string();
        archive.push("_bak");
        let rebased_archive = target_dir(&job, Path::new(&archive));

        let req = transfer.last();
        assert_eq!(req.backup_dir, Some(rebased_archive.clone()));
        assert_eq!(req.destination, target_dir(&job, &second.snapshot));
        assert!(rebased_archive.is_dir());
        assert_ne!(rebased_archive, PathBuf::from(&archive));
    }

    #[test]
    fn test_snapshot_mirrors_into_root() {
        let fx = fixture();
        let job = job(&fx, RotationStrategy::Snapshot);
        let transfer = RecordingTransfer::default();
        let clock = clock();
        let engine = RotationEngine::new(&transfer, &clock);

        let report = engine.run(&job, None).unwrap();
        assert_eq!(report.snapshot, fx.root);

        let req = transfer.last();
        assert_eq!(req.destination, fx.root);
        assert!(req.delete);
        assert_eq!(req.link_dest, None);
        assert!(fs::symlink_metadata(fx.root.join("current")).is_err());
        assert_eq!(fs::read_dir(&fx.root).unwrap().count(), 0);
    }

    #[test]
    fn test_nested_destination_is_excluded() {
        let fx = fixture();
        let mut job = job(&fx, RotationStrategy::Incremental);
        job.source = fx.source.parent().unwrap().to_path_buf();
        let transfer = RecordingTransfer::default();
        let clock = clock();
        let engine = RotationEngine::new(&transfer, &clock);

        engine.run(&job, None).unwrap();
        assert_eq!(transfer.last().excludes, ["/backup/"]);
    }

    #[test]
    fn test_nested_destination_wildcards_are_escaped() {
        let fx = fixture();
        let mut job = job(&fx, RotationStrategy::Full);
        job.destination_root = fx.source.join("bk[1]");
        let transfer = RecordingTransfer::default();
        let clock = clock();
        let engine = RotationEngine::new(&transfer, &clock);

        engine.run(&job, None).unwrap();
        assert_eq!(transfer.last().excludes, [r"/bk\[1]/"]);

        assert_eq!(escape_pattern("plain\\name"), "plain\\name");
        assert_eq!(escape_pattern("a*b?c"), r"a\*b\?c");
    }

    #[test]
    fn test_nested_destination_through_symlink() {
        let fx = fixture();
        let alias = fx.source.parent().unwrap().join("alias");
        symlink(&fx.source, &alias).unwrap();
        fs::create_dir_all(fx.source.join("inner/store")).unwrap();

        let nested = nested_destination(&alias, &fx.source.join("inner/store")).unwrap();
        assert_eq!(nested, Some(PathBuf::from("inner/store")));
        assert_eq!(nested_destination(&fx.source, fx.source.parent().unwrap()).unwrap(), None);
        assert!(matches!(
            nested_destination(&alias, &fx.source),
            Err(BackupError::DestinationIsSource(_))
        ));
    }

    #[test]
    fn test_exclude_file_only_when_present() {
        let fx = fixture();
        let mut job = job(&fx, RotationStrategy::Full);
        job.exclude_file = Some(fx.root.with_file_name("missing-excludes"));
        let transfer = RecordingTransfer::default();
        let clock = clock();
        let engine = RotationEngine::new(&transfer, &clock);

        engine.run(&job, None).unwrap();
        assert_eq!(transfer.last().exclude_from, None);

        let excludes = fx.root.with_file_name("excludes");
        fs::write(&excludes, "*.tmp\n").unwrap();
        job.exclude_file = Some(excludes.clone());
        engine.run(&job, None).unwrap();
        assert_eq!(transfer.last().exclude_from, Some(excludes));
    }

    #[test]
    fn test_copy_failure_keeps_pointer() {
        let fx = fixture();
        let job = job(&fx, RotationStrategy::Incremental);
        let clock = clock();

        let ok = RecordingTransfer::default();
        let first = RotationEngine::new(&ok, &clock).run(&job, None).unwrap();

        let failing = RecordingTransfer::failing();
        let previous = RotationEngine::previous_snapshot(&job).unwrap();
        let err = RotationEngine::new(&failing, &clock)
            .run(&job, Some(&previous))
            .unwrap_err();

        assert!(matches!(err, BackupError::CopyFailed(_)));
        assert_eq!(
            fs::canonicalize(fx.root.join("current")).unwrap(),
            fs::canonicalize(first.snapshot).unwrap()
        );
    }

    #[test]
    fn test_nolinks_copy_failure_is_not_rolled_back() {
        let fx = fixture();
        let job = job(&fx, RotationStrategy::NoLinks);
        let clock = clock();

        let ok = RecordingTransfer::default();
        RotationEngine::new(&ok, &clock).run(&job, None).unwrap();
        let previous = RotationEngine::previous_snapshot(&job).unwrap();

        let failing = RecordingTransfer::failing();
        assert!(
            RotationEngine::new(&failing, &clock)
                .run(&job, Some(&previous))
                .is_err()
        );

        assert!(!previous.exists());
        assert!(fx.root.join("backup-2024-03-05T14:07_1").is_dir());
        assert!(fx.root.join("backup-2024-03-05T14:07_bak").is_dir());
        // The pointer still names the old folder, which is gone now.
        assert_eq!(
            fs::read_link(fx.root.join("current")).unwrap(),
            Path::new("backup-2024-03-05T14:07")
        );
        assert!(!fx.root.join("current").exists());
    }

    #[test]
    fn test_replace_link_overwrites_existing() {
        let temp = tempdir().unwrap();
        fs::create_dir(temp.path().join("one")).unwrap();
        fs::create_dir(temp.path().join("two")).unwrap();

        replace_link(temp.path(), "current", &temp.path().join("one")).unwrap();
        replace_link(temp.path(), "current", &temp.path().join("two")).unwrap();

        assert_eq!(fs::read_link(temp.path().join("current")).unwrap(), Path::new("two"));
        assert!(fs::symlink_metadata(temp.path().join(".current.tmp")).is_err());
    }
}
