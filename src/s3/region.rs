//! Bucket region cache
//!
//! Maps bucket name to region. Entries are created on first resolution and
//! only change when an error response names a different authoritative
//! region; nothing expires on a timer.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;

use crate::metrics;

/// Concurrency-safe bucket → region map.
///
/// Resolutions for different buckets never contend; two concurrent misses
/// for the same bucket may both discover, last writer wins.
#[derive(Debug, Clone, Default)]
pub struct RegionCache {
    entries: Arc<DashMap<String, String>>,
}

impl RegionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, bucket: &str) -> Option<String> {
        self.entries.get(bucket).map(|r| r.value().clone())
    }

    pub fn set(&self, bucket: &str, region: &str) {
        self.entries.insert(bucket.to_string(), region.to_string());
    }

    pub fn remove(&self, bucket: &str) {
        self.entries.remove(bucket);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Return the cached region, or run `discover` once and cache its answer.
    ///
    /// Errors are not cached.
    pub async fn get_or_discover<F, Fut, E>(&self, bucket: &str, discover: F) -> Result<String, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, E>>,
    {
        if let Some(region) = self.get(bucket) {
            metrics::record_region_cache(true);
            return Ok(region);
        }
        metrics::record_region_cache(false);

        let region = discover().await?;
        self.set(bucket, &region);
        Ok(region)
    }
}
