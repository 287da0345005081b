use crate::config::AppConfig;
use crate::core::clock::{Clock, SystemClock};
use std::sync::Arc;
use tracing::Span;
use uuid::Uuid;

/// Everything a run needs that is not specific to one job.
///
/// Components receive the context instead of reaching for globals: per-job spans are
/// created as children of `span`, so every log line carries the run id.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub clock: Arc<dyn Clock>,
    pub run_id: Uuid,
    pub span: Span,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: AppConfig, clock: Arc<dyn Clock>) -> Self {
        let run_id = Uuid::now_v7();
        let span = tracing::info_span!("run", run_id = %run_id);
        Self {
            config: Arc::new(config),
            clock,
            run_id,
            span,
        }
    }
}
