//! Retry tables and the jittered exponential backoff timer.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::Rng;
use reqwest::StatusCode;

use super::context::Context;
use super::error::S3ClientError;

/// Default number of attempts per request.
pub const MAX_RETRY: usize = 10;

/// Base delay between attempts.
pub const DEFAULT_RETRY_UNIT: Duration = Duration::from_millis(200);

/// Upper bound on a single delay.
pub const DEFAULT_RETRY_CAP: Duration = Duration::from_secs(1);

pub const MAX_JITTER: f64 = 1.0;
pub const NO_JITTER: f64 = 0.0;

/// Largest response body read when looking for a structured error.
pub const MAX_ERROR_BODY_SIZE: u64 = 5 * 1024 * 1024;

/// Random source shared by the client: backoff jitter and probe names.
pub type SharedRng = Arc<Mutex<StdRng>>;

/// Service error codes worth another attempt.
const RETRYABLE_S3_CODES: &[&str] = &[
    "RequestError",
    "RequestTimeout",
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "RequestThrottled",
    "InternalError",
    "ExpiredToken",
    "ExpiredTokenException",
    "SlowDown",
    "SlowDownWrite",
    "SlowDownRead",
];

/// HTTP statuses worth another attempt regardless of body.
const RETRYABLE_HTTP_STATUS: &[u16] = &[
    408, // Request Timeout
    429, // Too Many Requests
    499, // Client Closed Request (nginx)
    500, // Internal Server Error
    502, // Bad Gateway
    503, // Service Unavailable
    504, // Gateway Timeout
    520, // Web Server Returned an Unknown Error (Cloudflare)
];

pub fn is_s3_code_retryable(code: &str) -> bool {
    RETRYABLE_S3_CODES.contains(&code)
}

pub fn is_http_status_retryable(status: StatusCode) -> bool {
    RETRYABLE_HTTP_STATUS.contains(&status.as_u16())
}

/// 200, 204 and 206.
pub fn is_success_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::OK | StatusCode::NO_CONTENT | StatusCode::PARTIAL_CONTENT
    )
}

/// Whether a failed exchange may be attempted again.
///
/// Timeouts inside the transport are retried as long as the caller's
/// context is still live; certificate and protocol mismatches never are.
pub fn is_request_error_retryable(ctx: &Context, err: &S3ClientError) -> bool {
    if ctx.err().is_some() {
        return false;
    }
    match err {
        S3ClientError::Transport(e) => e.is_retryable(),
        S3ClientError::Io(_) => true,
        _ => false,
    }
}

/// Delay before the attempt following `attempt` (0-based).
///
/// `unit * 2^attempt`, capped, then reduced by up to `jitter` of itself.
pub fn backoff_delay(attempt: u32, unit: Duration, cap: Duration, jitter: f64, random: f64) -> Duration {
    let jitter = jitter.clamp(NO_JITTER, MAX_JITTER);
    let sleep = 2u32
        .checked_pow(attempt)
        .and_then(|factor| unit.checked_mul(factor))
        .map_or(cap, |d| d.min(cap));
    if jitter == NO_JITTER {
        return sleep;
    }
    sleep.mul_f64(1.0 - random.clamp(0.0, 1.0) * jitter)
}

/// Yields attempt numbers, sleeping with backoff between them.
///
/// The first attempt starts immediately. Every wait races the context, so a
/// cancellation aborts the sequence without waiting out the delay.
pub struct RetryTimer {
    max_attempts: usize,
    attempt: usize,
    unit: Duration,
    cap: Duration,
    jitter: f64,
    rng: SharedRng,
}

impl RetryTimer {
    pub fn new(max_attempts: usize, rng: SharedRng) -> Self {
        Self::with_backoff(max_attempts, DEFAULT_RETRY_UNIT, DEFAULT_RETRY_CAP, MAX_JITTER, rng)
    }

    pub fn with_backoff(
        max_attempts: usize,
        unit: Duration,
        cap: Duration,
        jitter: f64,
        rng: SharedRng,
    ) -> Self {
        Self {
            max_attempts,
            attempt: 0,
            unit,
            cap,
            jitter,
            rng,
        }
    }

    /// Next attempt number (1-based), or `None` when exhausted or cancelled.
    pub async fn next(&mut self, ctx: &Context) -> Option<usize> {
        if self.attempt >= self.max_attempts || ctx.err().is_some() {
            return None;
        }
        if self.attempt > 0 {
            let random = self.rng.lock().random::<f64>();
            let delay = backoff_delay(
                (self.attempt - 1) as u32,
                self.unit,
                self.cap,
                self.jitter,
                random,
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.done() => return None,
            }
        }
        self.attempt += 1;
        Some(self.attempt)
    }
}
