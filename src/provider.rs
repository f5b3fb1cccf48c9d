//! Cache-aside file provider
//!
//! ```text
//! fetch(hash)
//!     │
//!     ├─ hot tier ──────────────► serve  (bump hot atime, touch cold)
//!     │
//!     ├─ cold tier ─► copy to hot ─► serve  (touch cold)
//!     │
//!     └─ origin ────► write to hot ─► serve
//! ```
//!
//! Every path ends by opening the hot copy, so the caller holds an open
//! handle and a later eviction cannot truncate what it is streaming.

use crate::content_store::ContentStore;
use crate::error::FileError;
use crate::hash::ContentHash;
use crate::metrics::{
    Metrics, COUNTER_COLD_HITS, COUNTER_HOT_HITS, COUNTER_MISSES, COUNTER_ORIGIN_FETCHES,
};
use crate::origin::Origin;
use crate::touch::TouchPropagator;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::fs::File;
use tracing::{debug, warn};

/// Where a served file came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    Hot,
    Cold,
    Origin,
}

/// An open, servable file
#[derive(Debug)]
pub struct ServedFile {
    pub hash: ContentHash,
    pub size: u64,
    pub source: FetchSource,
    pub file: File,
}

pub struct CachedFileProvider {
    store: ContentStore,
    origin: Arc<dyn Origin>,
    touch: Arc<TouchPropagator>,
    metrics: Arc<Metrics>,
}

impl CachedFileProvider {
    pub fn new(
        store: ContentStore,
        origin: Arc<dyn Origin>,
        touch: Arc<TouchPropagator>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            origin,
            touch,
            metrics,
        }
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn touch(&self) -> &TouchPropagator {
        &self.touch
    }

    /// Resolve a file, populating the hot tier on a miss.
    ///
    /// Returns `Ok(None)` when no tier and no origin has it.
    pub async fn fetch(&self, hash: &ContentHash) -> Result<Option<ServedFile>, FileError> {
        let hot = self.store.hot();

        if let Some((file, size)) = hot.open(hash).await? {
            self.metrics.inc_counter(COUNTER_HOT_HITS);
            self.record_access(hash, true).await;
            return Ok(Some(ServedFile {
                hash: hash.clone(),
                size,
                source: FetchSource::Hot,
                file,
            }));
        }

        if let Some(cold) = self.store.cold() {
            match hot.copy_from(cold, hash).await {
                Ok(size) => {
                    self.metrics.inc_counter(COUNTER_COLD_HITS);
                    debug!(hash = %hash, size, "Promoted file from cold tier");
                    self.record_access(hash, false).await;
                    return self.open_hot(hash, FetchSource::Cold).await;
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        match self.origin.fetch_remote(hash).await? {
            Some(bytes) => {
                self.metrics.inc_counter(COUNTER_ORIGIN_FETCHES);
                hot.write(hash, &bytes).await?;
                self.open_hot(hash, FetchSource::Origin).await
            }
            None => {
                self.metrics.inc_counter(COUNTER_MISSES);
                debug!(hash = %hash, "File unavailable");
                Ok(None)
            }
        }
    }

    /// Bump the hot access time (on hot hits) and propagate the touch.
    /// Both are synchronous metadata writes, so they run on the blocking pool.
    async fn record_access(&self, hash: &ContentHash, bump_hot: bool) {
        if !bump_hot && !self.touch.is_enabled() {
            return;
        }

        let hot = bump_hot.then(|| self.store.hot().clone());
        let touch = self.touch.clone();
        let hash = hash.clone();
        let result = tokio::task::spawn_blocking(move || {
            if let Some(hot) = hot {
                if let Err(e) = hot.touch(&hash, SystemTime::now()) {
                    debug!(hash = %hash, error = %e, "Failed to update hot access time");
                }
            }
            touch.touch(&hash);
        })
        .await;

        if let Err(e) = result {
            warn!(error = %e, "Access time update task failed");
        }
    }

    async fn open_hot(&self, hash: &ContentHash, source: FetchSource) -> Result<Option<ServedFile>, FileError> {
        match self.store.hot().open(hash).await? {
            Some((file, size)) => Ok(Some(ServedFile {
                hash: hash.clone(),
                size,
                source,
                file,
            })),
            None => {
                // Evicted between persist and open
                warn!(hash = %hash, "Hot copy vanished before it could be served");
                Ok(None)
            }
        }
    }
}
