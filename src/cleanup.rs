//! Tiered cleanup engine
//!
//! One long-lived task runs a sweep on clock-aligned boundaries
//! (every 15 minutes by default: :00, :15, :30, :45). Each sweep:
//!
//! ```text
//! ┌─ cold tier (if enabled) ─────────────────────────────────────┐
//! │ list (LRU first) → age/forced eviction → size eviction        │
//! │ → catalog: drop evicted entries, delete orphans (main only)   │
//! │ → delete hot copies of everything evicted from cold           │
//! └───────────────────────────────────────────────────────────────┘
//! ┌─ hot tier ────────────────────────────────────────────────────┐
//! │ list → age eviction (forced only with cold) → size eviction    │
//! │ → catalog: drop evicted entries if hot is authoritative,       │
//! │   delete orphans (main only)                                   │
//! └───────────────────────────────────────────────────────────────┘
//! temp file sweep → size/count gauges
//! ```
//!
//! Per-file failures are logged and skipped. Cancellation is checked between
//! file operations and ends the sweep early without error; files already
//! deleted are still dropped from the catalog and cascaded to the hot tier.
//! Catalog entries with no file in the authoritative tier are dropped after a
//! complete, uncancelled listing.

use crate::catalog::Catalog;
use crate::config::Config;
use crate::content_store::{delete_path, CachedFile, ContentStore, FileScan, TierStore};
use crate::hash::ContentHash;
use crate::metrics::{
    Metrics, COUNTER_FILES_EVICTED, GAUGE_FILES_TOTAL, GAUGE_FILES_TOTAL_COLD,
    GAUGE_FILES_TOTAL_SIZE, GAUGE_FILES_TOTAL_SIZE_COLD,
};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);
const HOUR: Duration = Duration::from_secs(60 * 60);

fn days(n: u64) -> Duration {
    Duration::from_secs(n.saturating_mul(DAY.as_secs()))
}

fn hours(n: u64) -> Duration {
    Duration::from_secs(n.saturating_mul(HOUR.as_secs()))
}

/// Limits for one tier
#[derive(Debug, Clone)]
pub struct TierPolicy {
    /// Files not accessed within this are evicted
    pub retention: Duration,
    /// Total size cap in bytes, 0 for unlimited
    pub size_limit_bytes: u64,
    /// Files written longer ago than this are evicted regardless of access
    pub forced_deletion_after: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub hot: TierPolicy,
    pub cold: TierPolicy,
    pub interval: Duration,
    pub temp_grace: Duration,
}

impl CleanupConfig {
    pub fn from_config(config: &Config) -> Self {
        let forced = (config.forced_deletion_after_hours > 0)
            .then(|| hours(config.forced_deletion_after_hours));

        Self {
            hot: TierPolicy {
                retention: days(config.hot_retention_days),
                size_limit_bytes: config.hot_size_limit_bytes,
                // Without a cold tier the hot copy is the only copy
                forced_deletion_after: if config.cold_dir().is_some() { forced } else { None },
            },
            cold: TierPolicy {
                retention: days(config.cold_retention_days),
                size_limit_bytes: config.cold_size_limit_bytes,
                forced_deletion_after: forced,
            },
            interval: config.cleanup_interval(),
            temp_grace: Duration::from_secs(config.temp_file_grace_minutes.saturating_mul(60)),
        }
    }
}

/// What one sweep did
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub cold_evicted: Vec<ContentHash>,
    pub hot_evicted: Vec<ContentHash>,
    pub cascaded: usize,
    pub orphans_removed: usize,
    pub catalog_removed: usize,
    /// Catalog entries dropped because the authoritative tier has no file
    pub dangling_removed: usize,
    pub temp_removed: usize,
    pub cancelled: bool,
}

pub struct CleanupEngine {
    store: ContentStore,
    /// Present only on the authoritative node
    catalog: Option<Arc<dyn Catalog>>,
    config: CleanupConfig,
    metrics: Arc<Metrics>,
}

impl CleanupEngine {
    pub fn new(
        store: ContentStore,
        catalog: Option<Arc<dyn Catalog>>,
        config: CleanupConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            catalog,
            config,
            metrics,
        }
    }

    /// Sweep both tiers now
    pub async fn run_once(&self, cancel: &CancellationToken) -> CleanupReport {
        self.run_once_at(SystemTime::now(), cancel).await
    }

    /// Sweep both tiers, judging ages against `now`
    pub async fn run_once_at(&self, now: SystemTime, cancel: &CancellationToken) -> CleanupReport {
        let mut report = CleanupReport::default();
        self.sweep(now, cancel, &mut report).await;
        report.cancelled = cancel.is_cancelled();

        info!(
            cold_evicted = report.cold_evicted.len(),
            hot_evicted = report.hot_evicted.len(),
            cascaded = report.cascaded,
            orphans = report.orphans_removed,
            catalog_removed = report.catalog_removed,
            dangling = report.dangling_removed,
            temp_removed = report.temp_removed,
            cancelled = report.cancelled,
            "Cleanup sweep finished"
        );
        report
    }

    /// Returns early on cancellation, but only after the catalog and the hot
    /// tier have caught up with every file already deleted.
    async fn sweep(&self, now: SystemTime, cancel: &CancellationToken, report: &mut CleanupReport) {
        // Reconciliation is skipped for this run if the catalog cannot be read
        let mut known = match &self.catalog {
            Some(catalog) => match catalog.list_all_hashes().await {
                Ok(hashes) => Some(hashes),
                Err(e) => {
                    error!(error = %e, "Failed to list catalog, skipping reconciliation");
                    None
                }
            },
            None => None,
        };

        if let Some(cold) = self.store.cold() {
            let scan = list_tier(cold).await;
            let complete = scan.is_complete();
            let mut files = scan.files;

            report.cold_evicted = self.evict(&mut files, &self.config.cold, now, cancel).await;
            if let Some(known) = known.as_mut() {
                report.catalog_removed += self.forget(known, &report.cold_evicted).await;
            }
            report.cascaded = self.cascade_to_hot(&report.cold_evicted).await;
            if cancel.is_cancelled() {
                return;
            }

            if let Some(known) = known.as_mut() {
                report.orphans_removed += self.remove_orphans(&mut files, known, cancel).await;
                if complete && !cancel.is_cancelled() {
                    report.dangling_removed += self.remove_dangling(known, &files).await;
                }
            }

            self.set_tier_gauges(&files, GAUGE_FILES_TOTAL_COLD, GAUGE_FILES_TOTAL_SIZE_COLD);
            if cancel.is_cancelled() {
                return;
            }
        }

        let hot_is_authoritative = self.store.cold().is_none();
        let scan = list_tier(self.store.hot()).await;
        let complete = scan.is_complete();
        let mut files = scan.files;

        report.hot_evicted = self.evict(&mut files, &self.config.hot, now, cancel).await;
        if hot_is_authoritative {
            if let Some(known) = known.as_mut() {
                report.catalog_removed += self.forget(known, &report.hot_evicted).await;
            }
        }
        if cancel.is_cancelled() {
            return;
        }

        if let Some(known) = known.as_mut() {
            report.orphans_removed += self.remove_orphans(&mut files, known, cancel).await;
            if hot_is_authoritative && complete && !cancel.is_cancelled() {
                report.dangling_removed += self.remove_dangling(known, &files).await;
            }
        }

        self.set_tier_gauges(&files, GAUGE_FILES_TOTAL, GAUGE_FILES_TOTAL_SIZE);
        if cancel.is_cancelled() {
            return;
        }

        report.temp_removed = self.sweep_temp_files(now).await;
    }

    /// Delete hot copies of files evicted from the cold tier
    async fn cascade_to_hot(&self, evicted: &[ContentHash]) -> usize {
        let mut removed = 0;
        for hash in evicted {
            match self.store.hot().delete(hash).await {
                Ok(true) => {
                    debug!(hash = %hash, "Removed hot copy of evicted cold file");
                    removed += 1;
                }
                Ok(false) => {}
                Err(e) => warn!(hash = %hash, error = %e, "Failed to remove hot copy"),
            }
        }
        removed
    }

    /// Age eviction followed by size eviction. Evicted files are removed
    /// from `files`; files that failed to delete stay.
    async fn evict(
        &self,
        files: &mut Vec<CachedFile>,
        policy: &TierPolicy,
        now: SystemTime,
        cancel: &CancellationToken,
    ) -> Vec<ContentHash> {
        let mut removed = Vec::new();
        let access_cutoff = now.checked_sub(policy.retention);
        let write_cutoff = policy.forced_deletion_after.and_then(|d| now.checked_sub(d));

        let mut kept = Vec::with_capacity(files.len());
        for file in files.drain(..) {
            if cancel.is_cancelled() {
                kept.push(file);
                continue;
            }

            let reason = if access_cutoff.is_some_and(|cutoff| file.last_access < cutoff) {
                Some("unused past retention")
            } else if write_cutoff.is_some_and(|cutoff| file.last_write < cutoff) {
                Some("written before forced deletion cutoff")
            } else {
                None
            };

            let deleted = match reason {
                Some(reason) => self.delete_file(&file, reason).await,
                None => false,
            };
            if deleted {
                removed.push(file.hash);
            } else {
                kept.push(file);
            }
        }
        *files = kept;

        if policy.size_limit_bytes == 0 {
            return removed;
        }

        // `files` is least-recently-accessed first
        let mut total: u64 = files.iter().map(|f| f.size_bytes).sum();
        let mut index = 0;
        while total > policy.size_limit_bytes && index < files.len() {
            if cancel.is_cancelled() {
                break;
            }
            if self.delete_file(&files[index], "over size limit").await {
                let file = files.remove(index);
                total -= file.size_bytes;
                removed.push(file.hash);
            } else {
                index += 1;
            }
        }

        removed
    }

    async fn delete_file(&self, file: &CachedFile, reason: &str) -> bool {
        match delete_path(&file.path).await {
            Ok(_) => {
                info!(tier = %file.tier, hash = %file.hash, size = file.size_bytes, reason, "Deleted file");
                self.metrics.inc_counter(COUNTER_FILES_EVICTED);
                true
            }
            Err(e) => {
                warn!(tier = %file.tier, hash = %file.hash, error = %e, "Failed to delete file");
                false
            }
        }
    }

    /// Drop evicted hashes from the catalog and the in-memory known set
    async fn forget(&self, known: &mut HashSet<ContentHash>, evicted: &[ContentHash]) -> usize {
        let Some(catalog) = &self.catalog else {
            return 0;
        };
        if evicted.is_empty() {
            return 0;
        }

        let evicted: HashSet<ContentHash> = evicted.iter().cloned().collect();
        match catalog.remove_hashes(&evicted).await {
            Ok(count) => {
                known.retain(|hash| !evicted.contains(hash));
                info!(count, "Removed evicted files from catalog");
                count
            }
            Err(e) => {
                // Left in `known` so the dangling-entry pass retries them
                error!(error = %e, "Failed to remove evicted files from catalog");
                0
            }
        }
    }

    /// Drop catalog entries whose file is missing from the authoritative
    /// tier. `files` must come from a complete listing of that tier.
    async fn remove_dangling(&self, known: &mut HashSet<ContentHash>, files: &[CachedFile]) -> usize {
        let Some(catalog) = &self.catalog else {
            return 0;
        };

        let present: HashSet<&ContentHash> = files.iter().map(|f| &f.hash).collect();
        let dangling: HashSet<ContentHash> = known
            .iter()
            .filter(|hash| !present.contains(hash))
            .cloned()
            .collect();
        if dangling.is_empty() {
            return 0;
        }

        match catalog.remove_hashes(&dangling).await {
            Ok(count) => {
                known.retain(|hash| !dangling.contains(hash));
                warn!(count, "Removed catalog entries with no stored file");
                count
            }
            Err(e) => {
                error!(error = %e, "Failed to remove dangling catalog entries");
                0
            }
        }
    }

    /// Delete physical files the catalog does not know about
    async fn remove_orphans(
        &self,
        files: &mut Vec<CachedFile>,
        known: &HashSet<ContentHash>,
        cancel: &CancellationToken,
    ) -> usize {
        let mut removed = 0;
        let mut kept = Vec::with_capacity(files.len());
        for file in files.drain(..) {
            if cancel.is_cancelled() || known.contains(&file.hash) {
                kept.push(file);
                continue;
            }
            if self.delete_file(&file, "not in catalog").await {
                removed += 1;
            } else {
                kept.push(file);
            }
        }
        *files = kept;
        removed
    }

    async fn sweep_temp_files(&self, now: SystemTime) -> usize {
        let Some(cutoff) = now.checked_sub(self.config.temp_grace) else {
            return 0;
        };

        let mut tiers = vec![self.store.hot().clone()];
        tiers.extend(self.store.cold().cloned());

        let mut removed = 0;
        for tier in tiers {
            let temps = match tokio::task::spawn_blocking(move || tier.list_temp_files()).await {
                Ok(temps) => temps,
                Err(e) => {
                    error!(error = %e, "Temp file listing task failed");
                    continue;
                }
            };
            for (path, modified) in temps {
                if modified >= cutoff {
                    continue;
                }
                match delete_path(&path).await {
                    Ok(true) => {
                        debug!(path = %path.display(), "Deleted stale temp file");
                        removed += 1;
                    }
                    Ok(false) => {}
                    Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete temp file"),
                }
            }
        }
        removed
    }

    fn set_tier_gauges(&self, files: &[CachedFile], count_gauge: &str, size_gauge: &str) {
        let bytes: u64 = files.iter().map(|f| f.size_bytes).sum();
        self.metrics.set_gauge(count_gauge, files.len() as i64);
        self.metrics.set_gauge(size_gauge, bytes as i64);
    }

    /// Populate the size/count gauges without deleting anything
    pub async fn init_gauges(&self) {
        if let Some(cold) = self.store.cold() {
            let scan = list_tier(cold).await;
            self.set_tier_gauges(&scan.files, GAUGE_FILES_TOTAL_COLD, GAUGE_FILES_TOTAL_SIZE_COLD);
        }
        let scan = list_tier(self.store.hot()).await;
        self.set_tier_gauges(&scan.files, GAUGE_FILES_TOTAL, GAUGE_FILES_TOTAL_SIZE);
    }

    /// Run sweeps on aligned boundaries until cancelled. Sweeps run inline in
    /// the loop, so they never overlap.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.config.interval.as_secs(),
                authoritative = self.catalog.is_some(),
                "Cleanup service started"
            );
            self.init_gauges().await;

            loop {
                if cancel.is_cancelled() {
                    break;
                }
                self.run_once(&cancel).await;

                let now = Utc::now();
                let next = next_aligned_run(now, self.config.interval);
                let wait = (next - now).to_std().unwrap_or(self.config.interval);
                info!(next_run = %next, "File cleanup complete");

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            info!("Cleanup service stopped");
        })
    }
}

async fn list_tier(store: &TierStore) -> FileScan {
    let store = store.clone();
    let tier = store.tier();
    match tokio::task::spawn_blocking(move || store.scan_files()).await {
        Ok(scan) => scan,
        Err(e) => {
            error!(tier = %tier, error = %e, "Listing task failed");
            FileScan {
                files: Vec::new(),
                errors: 1,
            }
        }
    }
}

/// Next boundary strictly after `now` that is a multiple of `interval`
/// since the epoch (e.g. :00/:15/:30/:45 for 15 minutes)
pub fn next_aligned_run(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let step = interval.as_secs().max(1) as i64;
    let next = (now.timestamp().div_euclid(step) + 1) * step;
    DateTime::from_timestamp(next, 0).unwrap_or(now + chrono::Duration::seconds(step))
}
