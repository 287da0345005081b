use chrono::{DateTime, Local};
use tracing::{error, info, info_span, warn};

use crate::config::JobConfig;
use crate::context::AppContext;
use crate::core::history::{HistoryStore, is_stale};
use crate::core::models::{BackupReport, JobStatus};
use crate::core::mount::VolumeMounter;
use crate::core::rotation::RotationEngine;
use crate::core::transfer_engine::{RsyncEngine, TransferEngine};
use crate::error::{BackupError, HistoryError, Phase};

/// What happened to one job during a run.
#[derive(Debug)]
pub enum JobOutcome {
    /// Not due yet.
    Skipped,
    Succeeded(BackupReport),
    Failed { phase: Phase, error: BackupError },
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub jobs: Vec<(String, JobOutcome)>,
}

impl RunSummary {
    pub fn succeeded(&self) -> usize {
        self.count(|o| matches!(o, JobOutcome::Succeeded(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, JobOutcome::Failed { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, JobOutcome::Skipped))
    }

    fn count(&self, pred: impl Fn(&JobOutcome) -> bool) -> usize {
        self.jobs.iter().filter(|(_, outcome)| pred(outcome)).count()
    }
}

/// Runs the configured jobs one after another.
pub struct Orchestrator {
    ctx: AppContext,
    mounter: VolumeMounter,
    transfer: Box<dyn TransferEngine>,
}

impl Orchestrator {
    pub fn new(ctx: AppContext, mounter: VolumeMounter, transfer: Box<dyn TransferEngine>) -> Self {
        Self {
            ctx,
            mounter,
            transfer,
        }
    }

    /// Orchestrator using the system mount tools and rsync.
    pub fn from_context(ctx: AppContext) -> Self {
        let mounter = VolumeMounter::system(&ctx.config);
        let transfer = Box::new(RsyncEngine::new(&ctx.config.rsync_binary));
        Self::new(ctx, mounter, transfer)
    }

    /// Run every due job in order and flush the history once at the end.
    ///
    /// Job failures are logged and recorded in the summary; only failing to write
    /// the history is an error.
    pub fn run(
        &self,
        jobs: &[JobConfig],
        history: &mut HistoryStore,
        force: bool,
    ) -> Result<RunSummary, HistoryError> {
        let _run = self.ctx.span.enter();
        info!(jobs = jobs.len(), force, "Starting backup run");

        let mut summary = RunSummary::default();

        for job in jobs {
            let span = info_span!(parent: &self.ctx.span, "job", job = %job.name);
            let _enter = span.enter();

            let now = self.ctx.clock.now().timestamp();
            if !history.is_due(&job.name, job.frequency_seconds, now, force) {
                info!(
                    last_backup = history.last_run(&job.name),
                    frequency_seconds = job.frequency_seconds,
                    "Previous backup not outdated, skipping"
                );
                summary.jobs.push((job.name.clone(), JobOutcome::Skipped));
                continue;
            }

            info!(strategy = job.strategy.as_str(), "Making new backup");
            let outcome = match self.run_job(job) {
                Ok(report) => {
                    history.record_success(&job.name, self.ctx.clock.now().timestamp());
                    JobOutcome::Succeeded(report)
                }
                Err(error) => {
                    let phase = error.phase();
                    error!(phase = %phase, error = %error, "Backup failed");
                    JobOutcome::Failed { phase, error }
                }
            };
            summary.jobs.push((job.name.clone(), outcome));
        }

        history.flush()?;

        info!(
            succeeded = summary.succeeded(),
            failed = summary.failed(),
            skipped = summary.skipped(),
            "Backup run finished"
        );
        Ok(summary)
    }

    fn run_job(&self, job: &JobConfig) -> Result<BackupReport, BackupError> {
        let outcome = self.mounter.mount(job.mount.as_ref())?;
        let guard = self.mounter.guard(outcome);

        let engine = RotationEngine::new(self.transfer.as_ref(), self.ctx.clock.as_ref());
        let previous = RotationEngine::previous_snapshot(job);
        let result = engine.run(job, previous.as_deref());

        match (result, guard.release()) {
            (Ok(report), Ok(())) => Ok(report),
            (Ok(report), Err(unmount)) => {
                // The backup itself is complete; it still counts as a success.
                warn!(phase = %Phase::Unmount, error = %unmount, "Backup succeeded but unmounting failed");
                Ok(report)
            }
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(unmount)) => {
                error!(phase = %Phase::Unmount, error = %unmount, "Unmounting after failed backup failed");
                Err(err)
            }
        }
    }
}

/// Schedule state of each job as of `now`.
pub fn job_statuses(jobs: &[JobConfig], history: &HistoryStore, now: DateTime<Local>) -> Vec<JobStatus> {
    jobs.iter()
        .map(|job| {
            let last = history.last_run(&job.name);
            let last_backup = (last > 0)
                .then(|| DateTime::from_timestamp(last, 0))
                .flatten()
                .map(|ts| ts.with_timezone(&Local));
            let frequency = i64::try_from(job.frequency_seconds).unwrap_or(i64::MAX);
            let next_due = DateTime::from_timestamp(last.saturating_add(frequency).saturating_add(1), 0)
                .map(|ts| ts.with_timezone(&Local))
                .unwrap_or(now);

            JobStatus {
                name: job.name.clone(),
                strategy: job.strategy,
                destination: job.destination_root.clone(),
                last_backup,
                next_due,
                due: is_stale(last, job.frequency_seconds, now.timestamp()),
            }
        })
        .collect()
}
