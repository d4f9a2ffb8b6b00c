//! Credential dedup gate
//!
//! Coalesces concurrent credential fetches per key. The first caller for a
//! key starts the fetch; callers arriving while it runs attach to the same
//! shared future and observe the same outcome. The entry is dropped as soon
//! as the fetch resolves, so the next call always starts fresh: this is
//! suppression, not caching.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use super::credentials::Credentials;
use super::error::S3ClientError;

type SharedFetch = Shared<BoxFuture<'static, Result<Credentials, Arc<S3ClientError>>>>;

type InFlight = Arc<Mutex<HashMap<String, (u64, SharedFetch)>>>;

/// At most one credential fetch in flight per key.
#[derive(Clone, Default)]
pub struct CredentialGate {
    inflight: InFlight,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for CredentialGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialGate")
            .field("in_flight", &self.inflight.lock().len())
            .finish()
    }
}

impl CredentialGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with a fetch currently running.
    pub fn in_flight(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Run `fetch` for `key` unless a fetch for the same key is already running.
    ///
    /// `fetch` is only invoked by the caller that starts a new fetch. A shared
    /// failure comes back as [`S3ClientError::CredentialFetch`].
    pub async fn fetch<F, Fut>(&self, key: &str, fetch: F) -> Result<Credentials, S3ClientError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Credentials, S3ClientError>> + Send + 'static,
    {
        let shared = {
            let mut inflight = self.inflight.lock();
            match inflight.get(key) {
                Some((_, shared)) => {
                    tracing::debug!(key = %key, "Joining in-flight credential fetch");
                    shared.clone()
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let shared = Self::start(self.inflight.clone(), key.to_string(), id, fetch());
                    inflight.insert(key.to_string(), (id, shared.clone()));
                    shared
                }
            }
        };

        shared.await.map_err(S3ClientError::CredentialFetch)
    }

    fn start<Fut>(inflight: InFlight, key: String, id: u64, fetch: Fut) -> SharedFetch
    where
        Fut: Future<Output = Result<Credentials, S3ClientError>> + Send + 'static,
    {
        async move {
            let result = fetch.await.map_err(Arc::new);
            // Leave before the result is published so late callers start over.
            let mut inflight = inflight.lock();
            if inflight.get(&key).is_some_and(|(entry, _)| *entry == id) {
                inflight.remove(&key);
            }
            result
        }
        .boxed()
        .shared()
    }
}
