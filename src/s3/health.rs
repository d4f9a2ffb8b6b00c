//! Endpoint health monitor
//!
//! # State machine
//!
//! ```text
//!            start               probe ok
//! Unknown ─────────► Offline ◄──────────────► Online
//!    ▲                  │     network failure    │
//!    └──────────────────┴────────────────────────┘
//!                       stop
//! ```
//!
//! `Unknown` means nobody is watching and every request is attempted.
//! `Offline` makes the client reject new requests without touching the
//! network. Promotion only comes from probes; demotion comes from any
//! request that observes a network-level failure.

use std::future::Future;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::context::Context;
use super::error::{S3ClientError, ACCESS_DENIED, NO_SUCH_BUCKET};
use super::retry::SharedRng;
use crate::metrics;

/// Shortest accepted probe interval.
pub const MIN_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on a single probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

const PROBE_BUCKET_PREFIX: &str = "probe-health-";
const PROBE_BUCKET_LEN: usize = 30;
const PROBE_BUCKET_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

const UNKNOWN: i32 = -1;
const OFFLINE: i32 = 0;
const ONLINE: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Unknown,
    Offline,
    Online,
}

impl HealthStatus {
    fn from_raw(raw: i32) -> Self {
        match raw {
            OFFLINE => HealthStatus::Offline,
            ONLINE => HealthStatus::Online,
            _ => HealthStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Offline => "offline",
            HealthStatus::Online => "online",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared tri-state; every transition is a compare-and-swap.
#[derive(Debug, Clone)]
pub struct HealthState {
    raw: Arc<AtomicI32>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            raw: Arc::new(AtomicI32::new(UNKNOWN)),
        }
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> HealthStatus {
        HealthStatus::from_raw(self.raw.load(Ordering::SeqCst))
    }

    pub fn is_offline(&self) -> bool {
        self.status() == HealthStatus::Offline
    }

    /// True unless the monitor has the endpoint marked offline.
    pub fn is_online(&self) -> bool {
        !self.is_offline()
    }

    fn transition(&self, from: i32, to: i32) -> bool {
        let swapped = self
            .raw
            .compare_exchange(from, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if swapped {
            metrics::set_health_status(to as i64);
        }
        swapped
    }

    /// Unknown → Offline; fails if a monitor already owns the state.
    fn begin(&self) -> bool {
        self.transition(UNKNOWN, OFFLINE)
    }

    /// Offline → Online.
    fn promote(&self) -> bool {
        self.transition(OFFLINE, ONLINE)
    }

    /// Online → Offline. No effect when the monitor is not running.
    pub fn mark_offline(&self) -> bool {
        self.transition(ONLINE, OFFLINE)
    }

    fn reset(&self) {
        self.raw.store(UNKNOWN, Ordering::SeqCst);
        metrics::set_health_status(UNKNOWN as i64);
    }
}

/// Random bucket name that almost certainly does not exist.
pub fn probe_bucket_name(rng: &SharedRng) -> String {
    let mut rng = rng.lock();
    let suffix: String = (0..PROBE_BUCKET_LEN - PROBE_BUCKET_PREFIX.len())
        .map(|_| PROBE_BUCKET_CHARS[rng.random_range(0..PROBE_BUCKET_CHARS.len())] as char)
        .collect();
    format!("{PROBE_BUCKET_PREFIX}{suffix}")
}

/// Any answer from the server proves liveness, even a 403.
pub fn probe_reachable(result: &Result<String, S3ClientError>) -> bool {
    match result {
        Ok(_) => true,
        Err(e) if e.is_canceled() || e.is_network_or_host_down(false) => false,
        Err(e) => matches!(e.code(), NO_SUCH_BUCKET | ACCESS_DENIED | ""),
    }
}

/// Running monitor. Dropping it stops the background loop.
#[derive(Debug)]
pub struct HealthCheckHandle {
    ctx: Context,
    task: Option<JoinHandle<()>>,
}

impl HealthCheckHandle {
    /// Stop probing and wait until the state is back to `Unknown`.
    pub async fn stop(mut self) {
        self.ctx.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for HealthCheckHandle {
    fn drop(&mut self) {
        self.ctx.cancel();
    }
}

async fn run_probe<P, Fut>(state: &HealthState, ctx: &Context, probe: &P)
where
    P: Fn(Context) -> Fut,
    Fut: Future<Output = Result<String, S3ClientError>>,
{
    let result = probe(ctx.with_timeout(PROBE_TIMEOUT)).await;
    if probe_reachable(&result) {
        if state.promote() {
            info!("Endpoint is online");
        }
    } else if let Err(e) = result {
        debug!(error = %e, "Health probe failed");
    }
}

/// Start the monitor: one synchronous probe, then a probe every `interval`
/// while the endpoint is offline.
pub async fn start<P, Fut>(
    state: HealthState,
    interval: Duration,
    probe: P,
) -> Result<HealthCheckHandle, S3ClientError>
where
    P: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, S3ClientError>> + Send + 'static,
{
    if state.status() != HealthStatus::Unknown {
        return Err(S3ClientError::HealthCheckRunning);
    }
    if interval < MIN_HEALTH_CHECK_INTERVAL {
        return Err(S3ClientError::HealthCheckInterval);
    }
    if !state.begin() {
        return Err(S3ClientError::HealthCheckRunning);
    }

    let ctx = Context::background().with_cancel();
    run_probe(&state, &ctx, &probe).await;
    info!(status = %state.status(), interval_secs = interval.as_secs_f64(), "Health check started");

    let loop_ctx = ctx.clone();
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = loop_ctx.done() => {
                    state.reset();
                    info!("Health check stopped");
                    return;
                }
                _ = tokio::time::sleep(interval) => {
                    if state.is_offline() {
                        warn!("Endpoint offline, probing");
                        run_probe(&state, &loop_ctx, &probe).await;
                    }
                }
            }
        }
    });

    Ok(HealthCheckHandle {
        ctx,
        task: Some(task),
    })
}
