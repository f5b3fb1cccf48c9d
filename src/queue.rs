//! Download request admission queue
//!
//! Downloads happen in three steps so disk/network load stays bounded no
//! matter how fast clients poll:
//!
//! 1. `enqueue` - client registers the hashes it wants, gets a request id
//! 2. `check` / `activate` - request takes one of N download slots when free
//! 3. the batch fetch streams the files; dropping the stream calls `finish`
//!
//! Slots are permits of a semaphore owned by this queue; an active request
//! holds its permit until finished, so the cap holds under any interleaving.
//! Every lookup is scoped to the enqueuing caller, and finished or expired
//! ids stay terminal.

use crate::hash::ContentHash;
use crate::metrics::{Metrics, GAUGE_ACTIVE_REQUESTS, GAUGE_QUEUED_REQUESTS};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Opaque request handle
pub type RequestId = Uuid;

/// Request lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    Queued,
    Active,
    Finished,
    Expired,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Finished | RequestState::Expired)
    }
}

/// A client's download request
#[derive(Debug, Clone, Serialize)]
pub struct DownloadRequest {
    pub id: RequestId,
    pub owner_id: String,
    pub file_hashes: Vec<ContentHash>,
    pub state: RequestState,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
}

/// Result of a caller polling its request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    /// Holds a slot; the batch may be fetched
    Active,
    /// Still waiting for a slot
    Queued,
    /// Unknown, terminal, or not this caller's request
    Unusable,
}

/// Queue limits
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum simultaneously active requests
    pub max_concurrent: usize,
    /// Queued requests older than this expire
    pub request_expiry: Duration,
    /// Active requests whose stream has not started within this are finished
    pub active_timeout: Duration,
    /// How long terminal requests are remembered
    pub terminal_retention: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 50,
            request_expiry: Duration::from_secs(300),
            active_timeout: Duration::from_secs(60),
            terminal_retention: Duration::from_secs(600),
        }
    }
}

/// Counts from one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub expired: usize,
    pub timed_out: usize,
    pub forgotten: usize,
}

struct Slot {
    request: DownloadRequest,
    permit: Option<OwnedSemaphorePermit>,
    queued_at: Instant,
    activated_at: Option<Instant>,
    ended_at: Option<Instant>,
    streaming: bool,
}

pub struct RequestQueue {
    requests: DashMap<RequestId, Slot>,
    slots: Arc<Semaphore>,
    config: QueueConfig,
    metrics: Arc<Metrics>,
}

impl RequestQueue {
    pub fn new(config: QueueConfig, metrics: Arc<Metrics>) -> Self {
        info!(max_concurrent = config.max_concurrent, "Request queue initialized");
        Self {
            requests: DashMap::new(),
            slots: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Register a request for `hashes`. Always succeeds.
    pub fn enqueue(&self, owner_id: &str, hashes: Vec<ContentHash>) -> RequestId {
        let id = Uuid::new_v4();
        let request = DownloadRequest {
            id,
            owner_id: owner_id.to_string(),
            file_hashes: hashes,
            state: RequestState::Queued,
            created_at: Utc::now(),
            activated_at: None,
        };

        debug!(request_id = %id, owner = owner_id, files = request.file_hashes.len(), "Enqueued request");

        self.requests.insert(
            id,
            Slot {
                request,
                permit: None,
                queued_at: Instant::now(),
                activated_at: None,
                ended_at: None,
                streaming: false,
            },
        );
        self.metrics.inc_gauge(GAUGE_QUEUED_REQUESTS);
        id
    }

    /// Move a queued request to active if a slot is free.
    ///
    /// Returns `true` if the request is active afterwards (including when it
    /// already was), `false` if unknown, terminal, or no slot is available.
    pub fn activate(&self, id: RequestId) -> bool {
        let Some(mut slot) = self.requests.get_mut(&id) else {
            return false;
        };
        self.activate_slot(&mut slot)
    }

    fn activate_slot(&self, slot: &mut Slot) -> bool {
        match slot.request.state {
            RequestState::Active => true,
            RequestState::Finished | RequestState::Expired => false,
            RequestState::Queued => {
                // Non-blocking; the permit is held by the slot until finish
                let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
                    return false;
                };
                slot.permit = Some(permit);
                slot.activated_at = Some(Instant::now());
                slot.request.activated_at = Some(Utc::now());
                slot.request.state = RequestState::Active;
                self.metrics.dec_gauge(GAUGE_QUEUED_REQUESTS);
                self.metrics.inc_gauge(GAUGE_ACTIVE_REQUESTS);
                debug!(request_id = %slot.request.id, "Activated request");
                true
            }
        }
    }

    /// Poll on behalf of `owner_id`, activating the request when possible
    pub fn check(&self, id: RequestId, owner_id: &str) -> CheckStatus {
        let Some(mut slot) = self.requests.get_mut(&id) else {
            return CheckStatus::Unusable;
        };
        if slot.request.owner_id != owner_id || slot.request.state.is_terminal() {
            return CheckStatus::Unusable;
        }
        if self.activate_slot(&mut slot) {
            CheckStatus::Active
        } else {
            CheckStatus::Queued
        }
    }

    /// Gate before streaming: the request exists, is active, and belongs to
    /// `owner_id`. Anything else yields `None`.
    pub fn is_active_and_owned(&self, id: RequestId, owner_id: &str) -> Option<DownloadRequest> {
        let slot = self.requests.get(&id)?;
        if slot.request.state == RequestState::Active && slot.request.owner_id == owner_id {
            Some(slot.request.clone())
        } else {
            None
        }
    }

    /// Gate and mark the stream as started, so the active timeout no longer
    /// applies. A request can only start streaming once.
    pub fn begin_streaming(&self, id: RequestId, owner_id: &str) -> Option<DownloadRequest> {
        let mut slot = self.requests.get_mut(&id)?;
        if slot.request.state != RequestState::Active
            || slot.request.owner_id != owner_id
            || slot.streaming
        {
            return None;
        }
        slot.streaming = true;
        Some(slot.request.clone())
    }

    /// Mark a request finished, releasing its slot if it held one.
    ///
    /// Returns `false` if the request was unknown or already terminal.
    pub fn finish(&self, id: RequestId) -> bool {
        let Some(mut slot) = self.requests.get_mut(&id) else {
            return false;
        };
        match slot.request.state {
            RequestState::Finished | RequestState::Expired => {
                debug!(request_id = %id, "Finish on terminal request ignored");
                false
            }
            RequestState::Queued => {
                self.end(&mut slot, RequestState::Finished);
                self.metrics.dec_gauge(GAUGE_QUEUED_REQUESTS);
                true
            }
            RequestState::Active => {
                self.end(&mut slot, RequestState::Finished);
                self.metrics.dec_gauge(GAUGE_ACTIVE_REQUESTS);
                debug!(request_id = %id, "Finished request");
                true
            }
        }
    }

    /// Finish only if `owner_id` enqueued the request
    pub fn cancel(&self, id: RequestId, owner_id: &str) -> bool {
        let owned = self
            .requests
            .get(&id)
            .map(|slot| slot.request.owner_id == owner_id)
            .unwrap_or(false);
        owned && self.finish(id)
    }

    fn end(&self, slot: &mut Slot, state: RequestState) {
        // Dropping the permit returns the slot to the semaphore
        slot.permit = None;
        slot.request.state = state;
        slot.ended_at = Some(Instant::now());
    }

    pub fn state(&self, id: RequestId) -> Option<RequestState> {
        self.requests.get(&id).map(|slot| slot.request.state)
    }

    /// Requests currently holding a slot
    pub fn active_count(&self) -> usize {
        self.config.max_concurrent - self.slots.available_permits()
    }

    pub fn queued_count(&self) -> usize {
        self.requests
            .iter()
            .filter(|slot| slot.request.state == RequestState::Queued)
            .count()
    }

    /// Expire stale queued requests, release active requests that never
    /// started streaming, and forget old terminal requests
    pub fn sweep(&self) -> SweepStats {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> SweepStats {
        let mut stats = SweepStats::default();

        for mut slot in self.requests.iter_mut() {
            match slot.request.state {
                RequestState::Queued
                    if now.saturating_duration_since(slot.queued_at) >= self.config.request_expiry =>
                {
                    self.end(&mut slot, RequestState::Expired);
                    self.metrics.dec_gauge(GAUGE_QUEUED_REQUESTS);
                    stats.expired += 1;
                }
                RequestState::Active if !slot.streaming => {
                    let waited = slot
                        .activated_at
                        .map(|t| now.saturating_duration_since(t))
                        .unwrap_or_default();
                    if waited >= self.config.active_timeout {
                        warn!(request_id = %slot.request.id, "Active request never fetched, releasing slot");
                        self.end(&mut slot, RequestState::Finished);
                        self.metrics.dec_gauge(GAUGE_ACTIVE_REQUESTS);
                        stats.timed_out += 1;
                    }
                }
                _ => {}
            }
        }

        let retention = self.config.terminal_retention;
        let before = self.requests.len();
        self.requests.retain(|_, slot| match slot.ended_at {
            Some(ended) => now.saturating_duration_since(ended) < retention,
            None => true,
        });
        stats.forgotten = before.saturating_sub(self.requests.len());

        if stats != SweepStats::default() {
            debug!(
                expired = stats.expired,
                timed_out = stats.timed_out,
                forgotten = stats.forgotten,
                "Swept request queue"
            );
        }
        stats
    }

    /// Run `sweep` periodically until cancelled
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        queue.sweep();
                    }
                }
            }
            debug!("Request queue sweeper stopped");
        })
    }
}

// ============================================================================
// Scoped release
// ============================================================================

/// Finishes a request when dropped, so every exit path of a download stream
/// (completion, error, client disconnect) gives the slot back.
pub struct FinishGuard {
    queue: Arc<RequestQueue>,
    id: RequestId,
}

impl FinishGuard {
    pub fn new(queue: Arc<RequestQueue>, id: RequestId) -> Self {
        Self { queue, id }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.queue.finish(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(max: usize) -> RequestQueue {
        RequestQueue::new(
            QueueConfig {
                max_concurrent: max,
                ..QueueConfig::default()
            },
            Arc::new(Metrics::new()),
        )
    }

    fn hashes() -> Vec<ContentHash> {
        vec![ContentHash::parse(&"a".repeat(40), 40).unwrap()]
    }

    #[test]
    fn test_admission_cap() {
        let q = queue(3);
        let ids: Vec<_> = (0..10).map(|i| q.enqueue(&format!("user{}", i), hashes())).collect();

        let activated = ids.iter().filter(|id| q.activate(**id)).count();
        assert_eq!(activated, 3);
        assert_eq!(q.active_count(), 3);
        assert_eq!(q.queued_count(), 7);

        // Freeing one slot admits exactly one more
        q.finish(ids[0]);
        let activated = ids[3..].iter().filter(|id| q.activate(**id)).count();
        assert_eq!(activated, 1);
        assert_eq!(q.active_count(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_admission_cap_concurrent() {
        let q = Arc::new(queue(5));
        let mut handles = Vec::new();
        for i in 0..64 {
            let q = Arc::clone(&q);
            handles.push(tokio::spawn(async move {
                let id = q.enqueue(&format!("user{}", i), hashes());
                let ok = q.activate(id);
                assert!(q.active_count() <= 5);
                ok
            }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
        assert_eq!(q.active_count(), 5);
    }

    #[test]
    fn test_ownership_isolation() {
        let q = queue(2);
        let id = q.enqueue("alice", hashes());

        assert_eq!(q.check(id, "mallory"), CheckStatus::Unusable);
        assert_eq!(q.state(id), Some(RequestState::Queued));
        assert!(q.is_active_and_owned(id, "alice").is_none());

        assert_eq!(q.check(id, "alice"), CheckStatus::Active);
        assert!(q.is_active_and_owned(id, "alice").is_some());
        assert!(q.is_active_and_owned(id, "mallory").is_none());
        assert!(q.begin_streaming(id, "mallory").is_none());
        assert!(!q.cancel(id, "mallory"));
        assert!(q.is_active_and_owned(Uuid::new_v4(), "alice").is_none());
    }

    #[test]
    fn test_check_reports_queued_when_full() {
        let q = queue(1);
        let first = q.enqueue("alice", hashes());
        let second = q.enqueue("bob", hashes());
        assert_eq!(q.check(first, "alice"), CheckStatus::Active);
        assert_eq!(q.check(second, "bob"), CheckStatus::Queued);
        q.finish(first);
        assert_eq!(q.check(second, "bob"), CheckStatus::Active);
    }

    #[test]
    fn test_terminal_states() {
        let q = queue(2);
        let id = q.enqueue("alice", hashes());
        assert!(q.activate(id));
        assert!(q.finish(id));
        assert_eq!(q.state(id), Some(RequestState::Finished));
        assert!(!q.activate(id));
        assert!(!q.finish(id));
        assert_eq!(q.check(id, "alice"), CheckStatus::Unusable);
        assert_eq!(q.active_count(), 0);

        let expired = q.enqueue("bob", hashes());
        let later = Instant::now() + Duration::from_secs(301);
        let stats = q.sweep_at(later);
        assert_eq!(stats.expired, 1);
        assert_eq!(q.state(expired), Some(RequestState::Expired));
        assert!(!q.activate(expired));
    }

    #[test]
    fn test_begin_streaming_once() {
        let q = queue(1);
        let id = q.enqueue("alice", hashes());
        assert!(q.activate(id));
        assert!(q.begin_streaming(id, "alice").is_some());
        assert!(q.begin_streaming(id, "alice").is_none());
    }

    #[test]
    fn test_sweep_releases_unfetched_active_requests() {
        let q = queue(1);
        let idle = q.enqueue("alice", hashes());
        assert!(q.activate(idle));

        let later = Instant::now() + Duration::from_secs(61);
        let stats = q.sweep_at(later);
        assert_eq!(stats.timed_out, 1);
        assert_eq!(q.active_count(), 0);

        // A streaming request is never timed out
        let busy = q.enqueue("bob", hashes());
        assert!(q.activate(busy));
        assert!(q.begin_streaming(busy, "bob").is_some());
        let stats = q.sweep_at(Instant::now() + Duration::from_secs(120));
        assert_eq!(stats.timed_out, 0);
        assert_eq!(q.state(busy), Some(RequestState::Active));
    }

    #[test]
    fn test_sweep_forgets_old_terminal_requests() {
        let q = queue(1);
        let id = q.enqueue("alice", hashes());
        q.finish(id);
        assert_eq!(q.sweep_at(Instant::now()).forgotten, 0);
        assert_eq!(q.sweep_at(Instant::now() + Duration::from_secs(601)).forgotten, 1);
        assert_eq!(q.state(id), None);
    }

    #[test]
    fn test_finish_guard_releases_slot() {
        let q = Arc::new(queue(1));
        let id = q.enqueue("alice", hashes());
        assert!(q.activate(id));
        {
            let _guard = FinishGuard::new(Arc::clone(&q), id);
            assert_eq!(q.active_count(), 1);
        }
        assert_eq!(q.active_count(), 0);
        assert_eq!(q.state(id), Some(RequestState::Finished));
    }

    #[test]
    fn test_gauges_track_transitions() {
        let metrics = Arc::new(Metrics::new());
        let q = RequestQueue::new(QueueConfig { max_concurrent: 1, ..QueueConfig::default() }, Arc::clone(&metrics));
        let a = q.enqueue("alice", hashes());
        let b = q.enqueue("bob", hashes());
        assert_eq!(metrics.gauge(GAUGE_QUEUED_REQUESTS), 2);
        q.activate(a);
        assert_eq!(metrics.gauge(GAUGE_QUEUED_REQUESTS), 1);
        assert_eq!(metrics.gauge(GAUGE_ACTIVE_REQUESTS), 1);
        q.finish(a);
        q.cancel(b, "bob");
        assert_eq!(metrics.gauge(GAUGE_QUEUED_REQUESTS), 0);
        assert_eq!(metrics.gauge(GAUGE_ACTIVE_REQUESTS), 0);
    }
}
