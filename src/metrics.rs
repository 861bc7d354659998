use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Metric name prefix for all showvault metrics
const PREFIX: &str = "showvault";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Jobs
    pub static ref JOBS_CREATED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_jobs_created_total"), "Jobs created by type"),
        &["type"]
    ).expect("Failed to create jobs_created_total metric");

    pub static ref JOBS_FINISHED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_jobs_finished_total"), "Jobs reaching a terminal status"),
        &["type", "status"]
    ).expect("Failed to create jobs_finished_total metric");

    // Downloads
    pub static ref DOWNLOADS_ACTIVE: Gauge = Gauge::new(
        format!("{PREFIX}_downloads_active"),
        "Downloads currently executing"
    ).expect("Failed to create downloads_active metric");

    pub static ref DOWNLOADS_FINISHED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_downloads_finished_total"), "Finished downloads by outcome"),
        &["status"]
    ).expect("Failed to create downloads_finished_total metric");

    pub static ref DOWNLOAD_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            format!("{PREFIX}_download_duration_seconds"),
            "Wall-clock duration of the external download process"
        )
        .buckets(vec![1.0, 10.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0])
    ).expect("Failed to create download_duration_seconds metric");

    // Scheduler
    pub static ref SCHEDULE_EXECUTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_schedule_executions_total"), "Schedule dispatches by outcome"),
        &["type", "status"]
    ).expect("Failed to create schedule_executions_total metric");

    pub static ref SCHEDULER_LOOP_RESTARTS_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_scheduler_loop_restarts_total"),
        "Evaluation loop recoveries after a panic"
    ).expect("Failed to create scheduler_loop_restarts_total metric");
}

/// Register every metric with [`REGISTRY`]. Safe to call more than once.
pub fn init_metrics() {
    let _ = REGISTRY.register(Box::new(JOBS_CREATED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_FINISHED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(DOWNLOADS_ACTIVE.clone()));
    let _ = REGISTRY.register(Box::new(DOWNLOADS_FINISHED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(DOWNLOAD_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(SCHEDULE_EXECUTIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(SCHEDULER_LOOP_RESTARTS_TOTAL.clone()));

    tracing::info!("Metrics system initialized successfully");
}

pub fn record_job_created(job_type: &str) {
    JOBS_CREATED_TOTAL.with_label_values(&[job_type]).inc();
}

pub fn record_job_finished(job_type: &str, status: &str) {
    JOBS_FINISHED_TOTAL
        .with_label_values(&[job_type, status])
        .inc();
}

pub fn set_active_downloads(count: usize) {
    DOWNLOADS_ACTIVE.set(count as f64);
}

pub fn record_download_finished(status: &str, duration: Duration) {
    DOWNLOADS_FINISHED_TOTAL.with_label_values(&[status]).inc();
    DOWNLOAD_DURATION_SECONDS.observe(duration.as_secs_f64());
}

pub fn record_schedule_execution(schedule_type: &str, status: &str) {
    SCHEDULE_EXECUTIONS_TOTAL
        .with_label_values(&[schedule_type, status])
        .inc();
}

pub fn record_scheduler_loop_restart() {
    SCHEDULER_LOOP_RESTARTS_TOTAL.inc();
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            String::from_utf8(buffer).unwrap_or_default(),
        ),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

/// Serve `GET /metrics` on `port` until `shutdown` fires.
pub async fn run_metrics_server(port: u16, shutdown: CancellationToken) -> anyhow::Result<()> {
    let app = Router::new().route("/metrics", get(metrics_handler));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("Metrics available at port {}", port);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
