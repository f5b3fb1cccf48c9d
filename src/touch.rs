//! Access-time propagation for files served from somewhere other than their
//! long-term tier
//!
//! When a file is served out of the hot tier (or by a shard node), the cold
//! copy never sees the read, so the cleanup engine would eventually age it
//! out while it is still popular. Touches push the recency signal back:
//!
//! - locally, by bumping the cold file's access time
//! - remotely, by batching hashes to the main server's touch endpoint
//!
//! Popular hashes are touched constantly, so each hash is debounced: repeated
//! touches within the window collapse into one metadata write. The debounce
//! map is swept every N calls instead of on a timer.

use crate::content_store::TierStore;
use crate::hash::ContentHash;
use crate::metrics::{Metrics, COUNTER_TOUCHES_APPLIED, COUNTER_TOUCHES_DEBOUNCED};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the remote forwarding channel; touches beyond it are dropped
const FORWARD_CHANNEL_CAPACITY: usize = 10_000;

/// Flush a remote batch at this size
pub const FORWARD_BATCH_SIZE: usize = 500;

/// Flush a non-empty remote batch at least this often
pub const FORWARD_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// What a touch did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchOutcome {
    /// No cold tier and no remote target
    Disabled,
    /// Already touched inside the debounce window
    Debounced,
    /// Cold file access time updated
    Applied,
    /// Queued for the main server
    Forwarded,
    /// Target file no longer exists
    Missing,
    /// Metadata update failed (logged)
    Failed,
}

pub struct TouchPropagator {
    cold: Option<TierStore>,
    remote: Option<mpsc::Sender<ContentHash>>,
    debounce: Duration,
    sweep_every: u64,
    last_update: DashMap<ContentHash, Instant>,
    calls: AtomicU64,
    metrics: Arc<Metrics>,
}

impl TouchPropagator {
    pub fn new(
        cold: Option<TierStore>,
        remote: Option<mpsc::Sender<ContentHash>>,
        debounce: Duration,
        sweep_every: u64,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            cold,
            remote,
            debounce,
            sweep_every: sweep_every.max(1),
            last_update: DashMap::with_capacity(1009),
            calls: AtomicU64::new(0),
            metrics,
        }
    }

    /// Propagator that never does anything
    pub fn disabled(metrics: Arc<Metrics>) -> Self {
        Self::new(None, None, Duration::ZERO, 1, metrics)
    }

    pub fn is_enabled(&self) -> bool {
        self.cold.is_some() || self.remote.is_some()
    }

    /// Record that `hash` was just served. Never fails.
    ///
    /// Applying a touch is a synchronous metadata write on the cold file, so
    /// async callers run this on the blocking pool.
    pub fn touch(&self, hash: &ContentHash) {
        self.touch_at(hash, Instant::now(), SystemTime::now());
    }

    /// Touch with explicit clocks: `now` drives debouncing, `wall` is the
    /// access time written to disk.
    pub fn touch_at(&self, hash: &ContentHash, now: Instant, wall: SystemTime) -> TouchOutcome {
        if !self.is_enabled() {
            return TouchOutcome::Disabled;
        }

        let calls = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if calls % self.sweep_every == 0 {
            self.sweep(now);
        }

        // The entry guard holds the shard lock, so check-then-update is atomic per hash
        match self.last_update.entry(hash.clone()) {
            Entry::Occupied(entry) if now.saturating_duration_since(*entry.get()) < self.debounce => {
                debug!(hash = %hash, "Debounced touch");
                self.metrics.inc_counter(COUNTER_TOUCHES_DEBOUNCED);
                TouchOutcome::Debounced
            }
            Entry::Occupied(mut entry) => match self.apply(hash, wall) {
                outcome @ (TouchOutcome::Missing | TouchOutcome::Failed) => {
                    entry.remove();
                    outcome
                }
                outcome => {
                    entry.insert(now);
                    outcome
                }
            },
            Entry::Vacant(entry) => match self.apply(hash, wall) {
                outcome @ (TouchOutcome::Missing | TouchOutcome::Failed) => outcome,
                outcome => {
                    entry.insert(now);
                    outcome
                }
            },
        }
    }

    fn apply(&self, hash: &ContentHash, wall: SystemTime) -> TouchOutcome {
        let mut outcome = TouchOutcome::Missing;

        if let Some(cold) = &self.cold {
            outcome = match cold.touch(hash, wall) {
                Ok(true) => {
                    debug!(hash = %hash, "Touched cold file");
                    self.metrics.inc_counter(COUNTER_TOUCHES_APPLIED);
                    TouchOutcome::Applied
                }
                Ok(false) => TouchOutcome::Missing,
                Err(e) => {
                    warn!(hash = %hash, error = %e, "Failed to touch cold file");
                    TouchOutcome::Failed
                }
            };
        }

        if let Some(remote) = &self.remote {
            match remote.try_send(hash.clone()) {
                Ok(()) => {
                    if outcome != TouchOutcome::Applied {
                        outcome = TouchOutcome::Forwarded;
                    }
                }
                Err(e) => debug!(hash = %hash, error = %e, "Dropped remote touch"),
            }
        }

        outcome
    }

    fn sweep(&self, now: Instant) {
        let before = self.last_update.len();
        self.last_update
            .retain(|_, last| now.saturating_duration_since(*last) < self.debounce);
        let removed = before.saturating_sub(self.last_update.len());
        if removed > 0 {
            debug!(removed, "Swept touch debounce map");
        }
    }

    /// Number of hashes currently inside their debounce window (or not yet swept)
    pub fn tracked(&self) -> usize {
        self.last_update.len()
    }
}

// ============================================================================
// Remote forwarding
// ============================================================================

/// Channel sender plus task handle for remote touch forwarding
pub struct RemoteTouchHandle {
    pub sender: mpsc::Sender<ContentHash>,
    pub task: JoinHandle<()>,
}

/// Spawn a task batching touches to `{main_url}/dist/touch`
pub fn spawn_remote_forwarder(
    main_url: &str,
    token: Option<String>,
    cancel: CancellationToken,
) -> RemoteTouchHandle {
    let (sender, rx) = mpsc::channel(FORWARD_CHANNEL_CAPACITY);
    let url = format!("{}/dist/touch", main_url.trim_end_matches('/'));
    let client = reqwest::Client::new();

    info!(url = %url, "Remote touch forwarding enabled");

    let task = tokio::spawn(run_forwarder(client, url, token, rx, cancel));
    RemoteTouchHandle { sender, task }
}

async fn run_forwarder(
    client: reqwest::Client,
    url: String,
    token: Option<String>,
    mut rx: mpsc::Receiver<ContentHash>,
    cancel: CancellationToken,
) {
    let mut batch: Vec<ContentHash> = Vec::with_capacity(FORWARD_BATCH_SIZE);
    let mut ticker = tokio::time::interval(FORWARD_FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Some(hash) => {
                    batch.push(hash);
                    if batch.len() >= FORWARD_BATCH_SIZE {
                        flush(&client, &url, token.as_deref(), &mut batch).await;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    flush(&client, &url, token.as_deref(), &mut batch).await;
                }
            }
        }
    }

    if !batch.is_empty() {
        flush(&client, &url, token.as_deref(), &mut batch).await;
    }
    info!("Remote touch forwarder stopped");
}

async fn flush(client: &reqwest::Client, url: &str, token: Option<&str>, batch: &mut Vec<ContentHash>) {
    let count = batch.len();
    let mut request = client.post(url).json(&*batch);
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }
    batch.clear();

    match request.send().await {
        Ok(response) if response.status().is_success() => {
            debug!(count, "Forwarded touches");
        }
        Ok(response) => {
            warn!(count, status = %response.status(), "Touch forwarding rejected");
        }
        Err(e) => {
            warn!(count, error = %e, "Touch forwarding failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_store::Tier;
    use tempfile::TempDir;

    fn hash(c: char) -> ContentHash {
        ContentHash::parse(&c.to_string().repeat(40), 40).unwrap()
    }

    fn atime(store: &TierStore, h: &ContentHash) -> SystemTime {
        std::fs::metadata(store.path_for(h)).unwrap().accessed().unwrap()
    }

    async fn cold_store(temp: &TempDir) -> TierStore {
        TierStore::new(Tier::Cold, temp.path(), 40).await.unwrap()
    }

    #[tokio::test]
    async fn test_debounce_updates_disk_once() {
        let temp = TempDir::new().unwrap();
        let cold = cold_store(&temp).await;
        let h = hash('a');
        cold.write(&h, b"data").await.unwrap();

        let propagator = TouchPropagator::new(
            Some(cold.clone()),
            None,
            Duration::from_secs(90),
            1000,
            Arc::new(Metrics::new()),
        );

        let old = SystemTime::now() - Duration::from_secs(30 * 86_400);
        cold.touch(&h, old).unwrap();

        let start = Instant::now();
        let first_wall = SystemTime::now() - Duration::from_secs(3600);
        assert_eq!(propagator.touch_at(&h, start, first_wall), TouchOutcome::Applied);
        let after_first = atime(&cold, &h);
        assert!(after_first > old);

        // Reset on disk; a second touch inside the window must not write again
        cold.touch(&h, old).unwrap();
        assert_eq!(
            propagator.touch_at(&h, start + Duration::from_secs(30), SystemTime::now()),
            TouchOutcome::Debounced
        );
        assert!(atime(&cold, &h) < after_first);

        // Outside the window it applies again
        assert_eq!(
            propagator.touch_at(&h, start + Duration::from_secs(91), SystemTime::now()),
            TouchOutcome::Applied
        );
        assert!(atime(&cold, &h) > old);
    }

    #[tokio::test]
    async fn test_disabled_without_cold_or_remote() {
        let propagator = TouchPropagator::disabled(Arc::new(Metrics::new()));
        assert!(!propagator.is_enabled());
        assert_eq!(
            propagator.touch_at(&hash('b'), Instant::now(), SystemTime::now()),
            TouchOutcome::Disabled
        );
        assert_eq!(propagator.tracked(), 0);
    }

    #[tokio::test]
    async fn test_missing_file_is_dropped_silently() {
        let temp = TempDir::new().unwrap();
        let cold = cold_store(&temp).await;
        let propagator =
            TouchPropagator::new(Some(cold), None, Duration::from_secs(90), 1000, Arc::new(Metrics::new()));

        let h = hash('c');
        assert_eq!(propagator.touch_at(&h, Instant::now(), SystemTime::now()), TouchOutcome::Missing);
        // Not recorded, so a later touch still tries
        assert_eq!(propagator.tracked(), 0);
        propagator.touch(&h);
    }

    #[tokio::test]
    async fn test_sweep_bounds_map() {
        let temp = TempDir::new().unwrap();
        let cold = cold_store(&temp).await;
        let hashes: Vec<ContentHash> = "0123456789".chars().map(hash).collect();
        for h in &hashes {
            cold.write(h, b"x").await.unwrap();
        }

        let propagator =
            TouchPropagator::new(Some(cold), None, Duration::from_secs(90), 5, Arc::new(Metrics::new()));

        let start = Instant::now();
        for h in &hashes[..4] {
            propagator.touch_at(h, start, SystemTime::now());
        }
        assert_eq!(propagator.tracked(), 4);

        // Fifth call sweeps everything older than the window before applying
        let later = start + Duration::from_secs(120);
        propagator.touch_at(&hashes[4], later, SystemTime::now());
        assert_eq!(propagator.tracked(), 1);
    }

    #[tokio::test]
    async fn test_remote_forwarding() {
        let (tx, mut rx) = mpsc::channel(8);
        let propagator =
            TouchPropagator::new(None, Some(tx), Duration::from_secs(90), 1000, Arc::new(Metrics::new()));

        let h = hash('d');
        let now = Instant::now();
        assert_eq!(propagator.touch_at(&h, now, SystemTime::now()), TouchOutcome::Forwarded);
        assert_eq!(propagator.touch_at(&h, now, SystemTime::now()), TouchOutcome::Debounced);

        assert_eq!(rx.recv().await, Some(h));
        assert!(rx.try_recv().is_err());
    }
}
