pub mod clock;
pub mod history;
pub mod models;
pub mod mount;
pub mod orchestrator;
pub mod rotation;
pub mod transfer_engine;

pub use clock::{Clock, FixedClock, SystemClock};
pub use history::HistoryStore;
pub use models::{BackupReport, JobStatus, MountSource, MountSpec, RotationStrategy};
pub use mount::{MountOutcome, VolumeMounter};
pub use orchestrator::{JobOutcome, Orchestrator, RunSummary, job_statuses};
pub use rotation::RotationEngine;
