//! Metrics module
//!
//! Prometheus instruments for the S3 client. Everything is registered in the
//! default registry on first use; [`gather`] renders the text exposition.

use std::time::Duration;

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_gauge, CounterVec, Encoder,
    HistogramVec, IntGauge, TextEncoder,
};

lazy_static! {
    // Request metrics
    pub static ref REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "mizuchi_s3_requests_total",
        "Total number of HTTP exchanges",
        &["method", "status"]
    ).unwrap();

    pub static ref REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "mizuchi_s3_request_duration_seconds",
        "HTTP exchange duration in seconds",
        &["method"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
    ).unwrap();

    pub static ref RETRIES_TOTAL: CounterVec = register_counter_vec!(
        "mizuchi_s3_retries_total",
        "Attempts repeated by the retry engine",
        &["reason"]  // "request", "network", "region" or "status"
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_STATUS: IntGauge = register_int_gauge!(
        "mizuchi_s3_health_status",
        "Endpoint health: -1 unknown, 0 offline, 1 online"
    ).unwrap();

    // Cache metrics
    pub static ref REGION_CACHE_LOOKUPS: CounterVec = register_counter_vec!(
        "mizuchi_s3_region_cache_lookups_total",
        "Region cache lookups",
        &["result"]
    ).unwrap();

    pub static ref CREDENTIAL_FETCHES: CounterVec = register_counter_vec!(
        "mizuchi_s3_credential_fetches_total",
        "Credential fetches started",
        &["source"]  // "provider" or "session"
    ).unwrap();
}

/// `2xx`, `4xx`... or `error` when no response arrived.
fn status_class(status: u16) -> &'static str {
    match status {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "error",
    }
}

/// Record one HTTP exchange. Pass status 0 for a transport failure.
pub fn record_request(method: &str, status: u16, duration: Duration) {
    REQUESTS_TOTAL
        .with_label_values(&[method, status_class(status)])
        .inc();
    REQUEST_DURATION
        .with_label_values(&[method])
        .observe(duration.as_secs_f64());
}

pub fn record_retry(reason: &str) {
    RETRIES_TOTAL.with_label_values(&[reason]).inc();
}

pub fn set_health_status(status: i64) {
    HEALTH_STATUS.set(status);
}

pub fn record_region_cache(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    REGION_CACHE_LOOKUPS.with_label_values(&[result]).inc();
}

pub fn record_credential_fetch(source: &str) {
    CREDENTIAL_FETCHES.with_label_values(&[source]).inc();
}

/// Render every registered metric in the Prometheus text format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
