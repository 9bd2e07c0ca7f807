//! Deduplicating work queue with per-key rate limiting.
//!
//! A key is in at most one of three places at a time:
//!
//! - **queued**: waiting for a worker (`dirty` and in `queue`)
//! - **processing**: handed out by [`WorkQueue::get`], not yet [`WorkQueue::done`]
//! - **processing and dirty**: re-added while in flight; it is queued again
//!   on `done`, never handed to a second worker concurrently
//!
//! Delayed adds are tracked separately and only enter the queue when their
//! deadline passes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::backoff::{BackoffPolicy, ItemBackoff};

/// Shared handle to a work queue. Clones refer to the same queue.
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

struct Inner<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    backoff: ItemBackoff<K>,
}

struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    /// Earliest pending deadline per delayed key.
    waiting: HashMap<K, Instant>,
    shutting_down: bool,
}

impl<K> WorkQueue<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    waiting: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                backoff: ItemBackoff::new(policy),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks `key` as needing work. A no-op when the key is already queued
    /// or the queue is shutting down.
    pub fn add(&self, key: K) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }

        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }

        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Adds `key` once `delay` has elapsed. Multiple pending delays for the
    /// same key collapse into the earliest deadline.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let deadline = Instant::now() + delay;
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            match state.waiting.get(&key) {
                Some(existing) if *existing <= deadline => return,
                _ => {
                    state.waiting.insert(key.clone(), deadline);
                }
            }
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let fire = {
                let mut state = queue.lock();
                if state.waiting.get(&key) == Some(&deadline) {
                    state.waiting.remove(&key);
                    true
                } else {
                    false
                }
            };
            if fire {
                queue.add(key);
            }
        });
    }

    /// Adds `key` after its current backoff delay and records a failure.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.inner.backoff.next_delay(&key);
        self.add_after(key, delay);
    }

    /// Clears the failure history of `key`.
    pub fn forget(&self, key: &K) {
        self.inner.backoff.forget(key);
    }

    /// Consecutive rate-limited requeues of `key` since the last `forget`.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner.backoff.failures(key)
    }

    /// Waits for the next key. Returns `None` once the queue is shut down.
    ///
    /// The returned key is marked processing until [`WorkQueue::done`].
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Marks `key` as finished. If it was re-added while processing it is
    /// queued again.
    pub fn done(&self, key: &K) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.shutting_down || !state.dirty.contains(key) {
            return;
        }

        state.queue.push_back(key.clone());
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Stops handing out keys. Pending and future adds are discarded and
    /// every blocked [`WorkQueue::get`] returns `None`.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.shutting_down = true;
        state.waiting.clear();
        drop(state);
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Keys ready to be handed out.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys currently held by workers.
    pub fn processing_len(&self) -> usize {
        self.lock().processing.len()
    }

    /// Keys waiting on a delayed add.
    pub fn waiting_len(&self) -> usize {
        self.lock().waiting.len()
    }
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> std::fmt::Debug for WorkQueue<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn queue() -> WorkQueue<&'static str> {
        WorkQueue::new(BackoffPolicy::new(
            Duration::from_millis(100),
            Duration::from_secs(1),
        ))
    }

    #[tokio::test]
    async fn test_add_deduplicates_queued_keys() {
        let q = queue();
        q.add("a");
        q.add("b");
        q.add("a");
        assert_eq!(q.len(), 2);

        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_readd_while_processing_requeues_once_on_done() {
        let q = queue();
        q.add("a");
        let key = q.get().await.unwrap();

        q.add("a");
        q.add("a");
        // Not handed out again while in flight.
        assert_eq!(q.len(), 0);
        assert_eq!(q.processing_len(), 1);

        q.done(&key);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some("a"));
        q.done(&"a");
        assert!(q.is_empty());
        assert_eq!(q.processing_len(), 0);
    }

    #[tokio::test]
    async fn test_get_wakes_on_add() {
        let q = queue();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };

        tokio::task::yield_now().await;
        q.add("a");
        assert_eq!(waiter.await.unwrap(), Some("a"));
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiters_and_ignores_adds() {
        let q = queue();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let q = q.clone();
                tokio::spawn(async move { q.get().await })
            })
            .collect();

        tokio::task::yield_now().await;
        q.shutdown();
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), None);
        }

        q.add("late");
        assert!(q.is_empty());
        assert_eq!(q.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_keeps_earliest_deadline() {
        let q = queue();
        q.add_after("a", Duration::from_secs(10));
        q.add_after("a", Duration::from_secs(2));
        q.add_after("a", Duration::from_secs(5));
        assert_eq!(q.waiting_len(), 1);

        tokio::time::sleep(Duration::from_millis(1_900)).await;
        assert!(q.is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(q.len(), 1);
        assert_eq!(q.waiting_len(), 0);

        // The superseded timers do not add the key again.
        assert_eq!(q.get().await, Some("a"));
        q.done(&"a");
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_rate_limited_backs_off_until_forget() {
        let q = queue();

        q.add_rate_limited("a");
        assert_eq!(q.num_requeues(&"a"), 1);
        tokio::time::sleep(Duration::from_millis(110)).await;
        assert_eq!(q.get().await, Some("a"));
        q.done(&"a");

        // Second failure waits twice as long.
        q.add_rate_limited("a");
        tokio::time::sleep(Duration::from_millis(110)).await;
        assert!(q.is_empty());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(q.len(), 1);

        q.forget(&"a");
        assert_eq!(q.num_requeues(&"a"), 0);
    }

    proptest! {
        #[test]
        fn prop_queue_holds_each_key_once(keys in proptest::collection::vec(0u8..16, 0..64)) {
            let q: WorkQueue<u8> = WorkQueue::new(BackoffPolicy::default());
            for key in &keys {
                q.add(*key);
            }

            let distinct: HashSet<_> = keys.iter().copied().collect();
            prop_assert_eq!(q.len(), distinct.len());
        }
    }
}
