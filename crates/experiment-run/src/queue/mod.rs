//! Deduplicating, rate-limited work queue
//!
//! Follows the usual controller work queue contract:
//!
//! - an item is queued at most once, however many times it is added
//! - an item handed out by [`WorkQueue::get`] is not handed out again until
//!   [`WorkQueue::done`] is called for it; adds that arrive meanwhile are
//!   remembered and requeue the item on `done`
//! - after [`WorkQueue::shut_down`] new adds are dropped and `get` returns
//!   `None` once the remaining items are drained

mod rate_limiter;

pub use rate_limiter::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialFailureRateLimiter,
    MaxOfRateLimiter, RateLimiter, RateLimiterConfig,
};

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

struct State<K> {
    queue: VecDeque<K>,
    /// Items that need processing, queued or not
    dirty: HashSet<K>,
    /// Items currently held by a worker
    processing: HashSet<K>,
    shutting_down: bool,
}

struct Inner<K> {
    name: String,
    state: Mutex<State<K>>,
    available: Notify,
    limiter: Box<dyn RateLimiter<K>>,
    delayed: CancellationToken,
}

/// Work queue shared between event handlers and workers. Cheap to clone.
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static,
{
    /// Create a queue whose rate-limited adds are delayed by `limiter`
    pub fn new(name: impl Into<String>, limiter: impl RateLimiter<K> + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                available: Notify::new(),
                limiter: Box::new(limiter),
                delayed: CancellationToken::new(),
            }),
        }
    }

    /// Mark `item` as needing processing
    pub fn add(&self, item: K) {
        let mut state = self.inner.state.lock();
        if state.shutting_down {
            return;
        }
        if !state.dirty.insert(item.clone()) {
            trace!(queue = %self.inner.name, ?item, "already queued");
            return;
        }
        if state.processing.contains(&item) {
            trace!(queue = %self.inner.name, ?item, "in flight, will requeue on done");
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.inner.available.notify_one();
    }

    /// Add `item` once `delay` has elapsed
    pub fn add_after(&self, item: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }

        trace!(queue = %self.inner.name, ?item, ?delay, "delaying add");
        let queue = self.clone();
        let cancelled = self.inner.delayed.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.add(item),
            }
        });
    }

    /// Add `item` after the delay the rate limiter assigns it.
    ///
    /// After shutdown the item is dropped without counting a requeue.
    pub fn add_rate_limited(&self, item: K) {
        if self.is_shutting_down() {
            return;
        }
        let delay = self.inner.limiter.when(&item);
        self.add_after(item, delay);
    }

    /// Wait for the next item and mark it as being processed.
    ///
    /// Returns `None` once the queue is shut down and empty.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent add or shut_down is not missed
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark `item` as no longer being processed
    pub fn done(&self, item: &K) {
        let mut state = self.inner.state.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            drop(state);
            self.inner.available.notify_one();
        }
    }

    /// Clear the rate limiter's failure history for `item`
    pub fn forget(&self, item: &K) {
        self.inner.limiter.forget(item);
    }

    /// Failures the rate limiter has recorded for `item`
    pub fn num_requeues(&self, item: &K) -> u32 {
        self.inner.limiter.num_requeues(item)
    }

    /// Number of items waiting to be handed out
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Whether nothing is waiting to be handed out
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting items and wake every waiting `get`
    pub fn shut_down(&self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.delayed.cancel();
        self.inner.available.notify_waiters();
    }

    /// Whether [`shut_down`](Self::shut_down) was called
    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }
}
