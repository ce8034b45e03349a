use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Days, NaiveDate, Utc};
use mary_core::{DateRange, RangeError};
use mary_storage::{ColumnStore, ReportingApi};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::SyncRunner;

/// `[today - lookback_days, today]`.
pub fn trailing_window(today: NaiveDate, lookback_days: u32) -> Result<DateRange, RangeError> {
    let start = today
        .checked_sub_days(Days::new(u64::from(lookback_days)))
        .ok_or_else(|| RangeError::InvalidDate(format!("{lookback_days} days before {today}")))?;
    DateRange::new(start, today)
}

/// Registers a job that syncs the trailing window on every `cron` tick. A tick
/// that fires while the previous run is still going is skipped.
pub async fn build_scheduler<A, S>(
    runner: Arc<SyncRunner<A, S>>,
    cron: &str,
    lookback_days: u32,
) -> Result<JobScheduler>
where
    A: ReportingApi + 'static,
    S: ColumnStore + 'static,
{
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let in_flight = Arc::new(Mutex::new(()));

    let job = Job::new_async(cron, move |_uuid, _l| {
        let runner = Arc::clone(&runner);
        let in_flight = Arc::clone(&in_flight);
        Box::pin(async move {
            let Ok(_guard) = in_flight.try_lock() else {
                warn!("previous scheduled sync still running; skipping tick");
                return;
            };
            let range = match trailing_window(Utc::now().date_naive(), lookback_days) {
                Ok(range) => range,
                Err(err) => {
                    error!(error = %err, "cannot compute sync window");
                    return;
                }
            };
            info!(%range, "scheduled sync triggered");
            match runner.run(range).await {
                Ok(outcome) if outcome.is_success() => info!(run_id = %outcome.run_id, "scheduled sync finished"),
                Ok(outcome) => error!(
                    run_id = %outcome.run_id,
                    failed = ?outcome.failed_entities(),
                    "scheduled sync finished with failures"
                ),
                Err(err) => error!(error = %err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
