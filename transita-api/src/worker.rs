use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use transita_booking::{Engine, Job, JobReport};
use transita_core::CoreResult;
use transita_store::app_config::{JobSchedule, JobsConfig};

use crate::metrics::Metrics;

/// Runs `job` once and counts the outcome.
pub async fn run_job(engine: &Engine, metrics: &Metrics, job: Job) -> CoreResult<JobReport> {
    let report = engine.jobs.run(job).await?;
    metrics.record_job(&report);
    Ok(report)
}

fn schedule_for(config: &JobsConfig, job: Job) -> JobSchedule {
    match job {
        Job::ExpireLocks => config.expire_locks,
        Job::ReconcilePayments => config.reconcile_payments,
        Job::ProcessRefunds => config.process_refunds,
        Job::CalculateSettlements => config.calculate_settlements,
        Job::CleanupIdempotency => config.cleanup_idempotency,
    }
}

/// One task per lifecycle job, each ticking on its own interval until
/// `shutdown` flips to true.
pub fn start_scheduler(
    engine: Engine,
    metrics: Arc<Metrics>,
    config: &JobsConfig,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    Job::all()
        .into_iter()
        .filter_map(|job| {
            let schedule = schedule_for(config, job);
            if schedule.interval_seconds == 0 {
                info!(job = job.as_str(), "job disabled");
                return None;
            }
            let engine = engine.clone();
            let metrics = metrics.clone();
            let mut shutdown = shutdown.clone();

            Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(schedule.interval_seconds));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                info!(job = job.as_str(), "scheduled every {}s", schedule.interval_seconds);

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = run_job(&engine, &metrics, job).await {
                                error!(job = job.as_str(), "job run failed: {}", e);
                            }
                        }
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                info!(job = job.as_str(), "job scheduler stopping");
                                break;
                            }
                        }
                    }
                }
            }))
        })
        .collect()
}
