use crate::core::transfer_engine::{TransferEngine, TransferRequest, TransferResult, TransferStats};
use crate::error::BackupError;
use regex::Regex;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::LazyLock;
use tracing::{debug, info};

// Lines from `rsync --stats`, e.g. "Number of regular files transferred: 1,024"
static FILES_TRANSFERRED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^Number of (?:regular )?files transferred: ([\d,.]+)").unwrap()
});
static TOTAL_FILE_SIZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^Total file size: ([\d,.]+) bytes").unwrap());
static TRANSFERRED_FILE_SIZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^Total transferred file size: ([\d,.]+) bytes").unwrap());

pub struct RsyncEngine {
    binary: PathBuf,
}

impl Default for RsyncEngine {
    fn default() -> Self {
        Self::new("rsync")
    }
}

impl RsyncEngine {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn build_args(req: &TransferRequest) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-a".into()];

        if !req.cross_filesystems {
            args.push("-x".into());
        }
        args.push("--stats".into());

        if req.delete {
            args.push("--delete".into());
        }
        if let Some(link_dest) = &req.link_dest {
            args.push(prefixed("--link-dest=", link_dest));
        }
        if let Some(backup_dir) = &req.backup_dir {
            args.push("-b".into());
            args.push(prefixed("--backup-dir=", backup_dir));
        }
        if let Some(log_file) = &req.log_file {
            args.push(prefixed("--log-file=", log_file));
        }
        if let Some(exclude_from) = &req.exclude_from {
            args.push(prefixed("--exclude-from=", exclude_from));
        }
        for pattern in &req.excludes {
            args.push(format!("--exclude={pattern}").into());
        }

        args.push(source_arg(&req.source));
        args.push(with_trailing_slash(&req.destination));
        args
    }
}

impl TransferEngine for RsyncEngine {
    fn transfer(&self, req: &TransferRequest) -> Result<TransferResult, BackupError> {
        let args = Self::build_args(req);

        info!(
            source = %req.source.display(),
            destination = %req.destination.display(),
            "(Rsync) Transferring"
        );
        debug!(binary = %self.binary.display(), ?args, "Running rsync");

        let output = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()
            .map_err(|e| {
                BackupError::CopyFailed(format!(
                    "failed to spawn {}: {}",
                    self.binary.display(),
                    e
                ))
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            debug!("(Rsync) {}", line);
        }

        if !output.status.success() {
            return Err(BackupError::CopyFailed(format!(
                "{} exited with {}",
                self.binary.display(),
                output.status
            )));
        }

        let stats = parse_stats(&stdout);
        if let Some(stats) = &stats {
            info!(
                files_transferred = stats.files_transferred,
                total_file_size = stats.total_file_size,
                transferred_file_size = stats.transferred_file_size,
                "Transfer complete"
            );
        }

        Ok(TransferResult { stats })
    }
}

/// Extract the summary counters from `rsync --stats` output.
pub fn parse_stats(output: &str) -> Option<TransferStats> {
    let files_transferred = capture_number(&FILES_TRANSFERRED, output)?;

    Some(TransferStats {
        files_transferred,
        total_file_size: capture_number(&TOTAL_FILE_SIZE, output).unwrap_or(0),
        transferred_file_size: capture_number(&TRANSFERRED_FILE_SIZE, output).unwrap_or(0),
    })
}

fn capture_number(re: &Regex, text: &str) -> Option<u64> {
    let caps = re.captures(text)?;
    // Thousands separators depend on the locale
    let digits: String = caps
        .get(1)?
        .as_str()
        .chars()
        .filter(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

fn prefixed(flag: &str, path: &Path) -> OsString {
    let mut arg = OsString::from(flag);
    arg.push(path);
    arg
}

/// Copy the directory's contents rather than the directory itself.
fn source_arg(source: &Path) -> OsString {
    if source == Path::new("/") {
        OsString::from("/")
    } else {
        with_trailing_slash(source)
    }
}

fn with_trailing_slash(path: &Path) -> OsString {
    let mut arg = path.as_os_str().to_os_string();
    if !path.as_os_str().as_encoded_bytes().ends_with(b"/") {
        arg.push("/");
    }
    arg
}
