//! Deduplicating, rate-limited work queue
//!
//! The queue holds distinct keys in FIFO order. A key that is added while it
//! is already queued collapses into the pending entry; a key that is added
//! while a worker is processing it is marked dirty and queued again once the
//! worker calls [`WorkQueue::done`]. Together this guarantees at most one
//! in-flight reconcile per key no matter how many workers drain the queue.
//!
//! Failed keys are re-added through [`WorkQueue::add_rate_limited`] with a
//! per-key exponential delay; [`WorkQueue::forget`] resets it after a
//! success.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// Default first retry delay
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
/// Default retry delay cap
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Per-key exponential backoff
#[derive(Debug, Clone)]
pub struct RateLimiter {
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl RateLimiter {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Delay before retry number `failures` (1-based): base * 2^(failures-1), capped.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

struct QueueState<T> {
    queue: VecDeque<T>,
    /// Keys that need processing: queued, or re-added while processing
    dirty: HashSet<T>,
    processing: HashSet<T>,
    failures: HashMap<T, u32>,
    shutting_down: bool,
}

struct Inner<T> {
    name: String,
    state: Mutex<QueueState<T>>,
    available: Notify,
    drained: Notify,
    limiter: RateLimiter,
    adds: metrics::Counter,
    retries: metrics::Counter,
    depth: metrics::Gauge,
}

/// Work queue of reconcile keys; cheap to clone
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_rate_limiter(name, RateLimiter::default())
    }

    pub fn with_rate_limiter(name: impl Into<String>, limiter: RateLimiter) -> Self {
        let name = name.into();
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                available: Notify::new(),
                drained: Notify::new(),
                limiter,
                adds: metrics::counter!(
                    "prometheus_operator_workqueue_adds_total",
                    "queue" => name.clone()
                ),
                retries: metrics::counter!(
                    "prometheus_operator_workqueue_retries_total",
                    "queue" => name.clone()
                ),
                depth: metrics::gauge!("prometheus_operator_workqueue_depth", "queue" => name.clone()),
                name,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Mark `item` as needing processing. Idempotent while it is pending.
    pub fn add(&self, item: T) {
        let mut state = self.inner.state.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        self.inner.adds.increment(1);
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            // Re-queued by `done`
            return;
        }
        state.queue.push_back(item);
        self.inner.depth.set(state.queue.len() as f64);
        drop(state);
        self.inner.available.notify_one();
    }

    /// Add `item` after `delay` has elapsed.
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Add `item` after its backoff delay and record one more failure.
    pub fn add_rate_limited(&self, item: T) {
        let failures = {
            let mut state = self.inner.state.lock();
            let count = state.failures.entry(item.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let delay = self.inner.limiter.delay_for(failures);
        self.inner.retries.increment(1);
        debug!(queue = %self.inner.name, item = ?item, failures, delay_ms = delay.as_millis() as u64, "Requeueing with backoff");
        self.add_after(item, delay);
    }

    /// Clear the failure history of `item`.
    pub fn forget(&self, item: &T) {
        self.inner.state.lock().failures.remove(item);
    }

    /// Number of failures recorded for `item` since it was last forgotten.
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.inner
            .state
            .lock()
            .failures
            .get(item)
            .copied()
            .unwrap_or(0)
    }

    /// Wait for the next item. Returns `None` once the queue shuts down.
    ///
    /// The caller owns the item until it calls [`WorkQueue::done`].
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.available.notified();
            {
                let mut state = self.inner.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    self.inner.depth.set(state.queue.len() as f64);
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Finish processing `item`, queueing it again if it was re-added meanwhile.
    pub fn done(&self, item: &T) {
        let mut state = self.inner.state.lock();
        state.processing.remove(item);
        let requeue = state.dirty.contains(item) && !state.shutting_down;
        if requeue {
            state.queue.push_back(item.clone());
            self.inner.depth.set(state.queue.len() as f64);
        }
        let drained = state.processing.is_empty();
        drop(state);
        if requeue {
            self.inner.available.notify_one();
        }
        if drained {
            self.inner.drained.notify_waiters();
        }
    }

    /// Number of queued items, excluding those being processed.
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    /// Stop accepting items and wake every waiting [`WorkQueue::get`].
    pub fn shut_down(&self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.available.notify_waiters();
    }

    /// Shut down and wait until every in-flight item is done.
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
        loop {
            let drained = self.inner.drained.notified();
            if self.inner.state.lock().processing.is_empty() {
                return;
            }
            drained.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let limiter = RateLimiter::new(Duration::from_millis(5), Duration::from_secs(1));
        assert_eq!(limiter.delay_for(1), Duration::from_millis(5));
        assert_eq!(limiter.delay_for(2), Duration::from_millis(10));
        assert_eq!(limiter.delay_for(4), Duration::from_millis(40));
        assert_eq!(limiter.delay_for(20), Duration::from_secs(1));
        assert_eq!(limiter.delay_for(u32::MAX), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_duplicate_adds_collapse() {
        let queue = WorkQueue::new("test");
        queue.add("a".to_string());
        queue.add("a".to_string());
        queue.add("b".to_string());
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get().await.as_deref(), Some("a"));
        assert_eq!(queue.get().await.as_deref(), Some("b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_add_while_processing_requeues_once_on_done() {
        let queue = WorkQueue::new("test");
        queue.add("a".to_string());
        let item = queue.get().await.unwrap();

        // Not handed out again while in flight
        queue.add("a".to_string());
        queue.add("a".to_string());
        assert!(queue.is_empty());

        queue.done(&item);
        assert_eq!(queue.len(), 1);
        let again = queue.get().await.unwrap();
        assert_eq!(again, "a");
        queue.done(&again);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_done_without_readd_does_not_requeue() {
        let queue = WorkQueue::new("test");
        queue.add(1u32);
        let item = queue.get().await.unwrap();
        queue.done(&item);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_add_waits_for_backoff() {
        let queue = WorkQueue::with_rate_limiter(
            "test",
            RateLimiter::new(Duration::from_secs(1), Duration::from_secs(10)),
        );
        queue.add_rate_limited("a".to_string());
        queue.add_rate_limited("a".to_string());
        assert_eq!(queue.num_requeues(&"a".to_string()), 2);
        assert!(queue.is_empty());

        // First retry fires after 1s, the second after 2s, and they collapse
        let item = queue.get().await.unwrap();
        assert_eq!(item, "a");
        queue.done(&item);

        queue.forget(&item);
        assert_eq!(queue.num_requeues(&item), 0);
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_getters() {
        let queue: WorkQueue<String> = WorkQueue::new("test");
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.shut_down();
        assert_eq!(waiter.await.unwrap(), None);

        queue.add("late".to_string());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_with_drain_waits_for_in_flight() {
        let queue = WorkQueue::new("test");
        queue.add("a".to_string());
        let item = queue.get().await.unwrap();

        let drain = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.shut_down_with_drain().await })
        };
        tokio::task::yield_now().await;
        assert!(!drain.is_finished());

        queue.done(&item);
        drain.await.unwrap();
        assert!(queue.get().await.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_workers_never_share_a_key() {
        let queue = WorkQueue::new("test");
        let in_flight = Arc::new(Mutex::new(HashSet::new()));
        for i in 0..50 {
            queue.add(i % 5);
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            let in_flight = in_flight.clone();
            handles.push(tokio::spawn(async move {
                let mut processed = 0;
                while processed < 10 {
                    let Ok(Some(item)) =
                        tokio::time::timeout(Duration::from_millis(50), queue.get()).await
                    else {
                        break;
                    };
                    assert!(in_flight.lock().insert(item), "key handed out twice");
                    tokio::task::yield_now().await;
                    in_flight.lock().remove(&item);
                    queue.done(&item);
                    processed += 1;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(queue.is_empty());
    }
}
