use axum::{extract::State, http::StatusCode};
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use transita_booking::JobReport;

use crate::state::AppState;

pub struct Metrics {
    pub registry: Registry,
    pub job_items: IntCounterVec,
    pub job_runs: IntCounterVec,
    pub seat_conflicts: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let job_items = IntCounterVec::new(
            Opts::new("transita_job_items_total", "Items handled by lifecycle jobs"),
            &["job", "outcome"],
        )?;
        let job_runs = IntCounterVec::new(Opts::new("transita_job_runs_total", "Lifecycle job runs"), &["job"])?;
        let seat_conflicts = IntCounter::new("transita_seat_conflicts_total", "Seat hold requests refused for contention")?;

        registry.register(Box::new(job_items.clone()))?;
        registry.register(Box::new(job_runs.clone()))?;
        registry.register(Box::new(seat_conflicts.clone()))?;

        Ok(Self { registry, job_items, job_runs, seat_conflicts })
    }

    pub fn record_job(&self, report: &JobReport) {
        let job = report.job.as_str();
        self.job_runs.with_label_values(&[job]).inc();
        self.job_items.with_label_values(&[job, "changed"]).inc_by(report.changed as u64);
        self.job_items
            .with_label_values(&[job, "unchanged"])
            .inc_by(report.succeeded().saturating_sub(report.changed) as u64);
        self.job_items.with_label_values(&[job, "failed"]).inc_by(report.failed as u64);
    }
}

pub async fn metrics_endpoint(State(state): State<AppState>) -> (StatusCode, String) {
    let encoder = TextEncoder::new();
    let families = state.metrics.registry.gather();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buf) {
        return (StatusCode::INTERNAL_SERVER_ERROR, format!("metrics encode error: {e}"));
    }
    (StatusCode::OK, String::from_utf8_lossy(&buf).to_string())
}
