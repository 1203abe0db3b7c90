// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Process-lifetime cache for remote classification layers.
//!
//! Entries are keyed by layer identity; a hit requires the query extent to
//! be contained in the stored extent. Fetches for the same key are
//! single-flight: a second caller awaits the first caller's result instead
//! of hitting the network. Unrelated keys proceed in parallel.

use crate::client::{FetchFailure, FetchLayer};
use crate::config::EngineConfig;
use afecciones_core::{Error, Extent, FeatureSet, LayerDescriptor, Result};
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

/// Retry behavior for transient fetch failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    /// First backoff delay; doubles on every retry.
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Retry behavior taken from the engine configuration.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_base_ms),
        }
    }

    /// Delay before the given retry attempt (0-based). Doubles per attempt;
    /// the shift is capped so large retry counts cannot overflow.
    fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

struct CacheEntry {
    extent: Extent,
    features: Arc<FeatureSet>,
}

/// In-memory layer cache with per-key fetch serialization.
pub struct LayerCache {
    fetcher: Arc<dyn FetchLayer>,
    retry: RetryPolicy,
    entries: StdMutex<FxHashMap<String, CacheEntry>>,
    locks: StdMutex<FxHashMap<String, Arc<AsyncMutex<()>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl LayerCache {
    pub fn new(fetcher: Arc<dyn FetchLayer>, retry: RetryPolicy) -> Self {
        Self {
            fetcher,
            retry,
            entries: StdMutex::new(FxHashMap::default()),
            locks: StdMutex::new(FxHashMap::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Fetch a layer for the given extent, serving from cache when a stored
    /// extent contains the query. On miss the result is stored (overwriting
    /// any stale entry for the key) before being returned.
    pub async fn fetch(
        &self,
        descriptor: &LayerDescriptor,
        extent: &Extent,
        force_refresh: bool,
    ) -> Result<Arc<FeatureSet>> {
        let key = descriptor.id();

        if !force_refresh {
            if let Some(hit) = self.lookup(&key, extent) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(layer = %descriptor.name(), "Layer cache hit");
                return Ok(hit);
            }
        }

        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        // Another caller may have completed the fetch while we waited.
        if !force_refresh {
            if let Some(hit) = self.lookup(&key, extent) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(hit);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let features = Arc::new(self.fetch_with_retry(descriptor, extent).await?);
        let fingerprint = fingerprint(&key, extent);

        tracing::debug!(
            layer = %descriptor.name(),
            fingerprint = %fingerprint,
            features = features.len(),
            "Layer fetched and cached"
        );

        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.insert(
            key,
            CacheEntry {
                extent: *extent,
                features: Arc::clone(&features),
            },
        );
        Ok(features)
    }

    /// Cached features for the key if a stored extent contains the query.
    /// Never touches the network; used by the degraded urbanistic path.
    pub fn cached(&self, descriptor: &LayerDescriptor, extent: &Extent) -> Option<Arc<FeatureSet>> {
        self.lookup(&descriptor.id(), extent)
    }

    /// (hits, misses) counters since creation.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    fn lookup(&self, key: &str, extent: &Extent) -> Option<Arc<FeatureSet>> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let entry = entries.get(key)?;
        if entry.extent.contains(extent) {
            Some(Arc::clone(&entry.features))
        } else {
            None
        }
    }

    fn key_lock(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    async fn fetch_with_retry(
        &self,
        descriptor: &LayerDescriptor,
        extent: &Extent,
    ) -> Result<FeatureSet> {
        let mut attempt = 0u32;
        loop {
            match self.fetcher.fetch(descriptor, extent).await {
                Ok(features) => return Ok(features),
                Err(FetchFailure { reason, retryable })
                    if retryable && attempt < self.retry.max_retries =>
                {
                    let delay = self.retry.backoff(attempt);
                    attempt += 1;
                    tracing::warn!(
                        layer = %descriptor.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Transient layer fetch failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(FetchFailure { reason, .. }) => {
                    return Err(Error::LayerFetch {
                        layer: descriptor.name().to_string(),
                        reason,
                    })
                }
            }
        }
    }
}

/// Fingerprint of (layer identity, extent) for logs and summaries.
fn fingerprint(key: &str, extent: &Extent) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    for v in [extent.min_x, extent.min_y, extent.max_x, extent.max_y] {
        hasher.update(v.to_bits().to_le_bytes());
    }
    hex::encode(&hasher.finalize()[..8])
}
