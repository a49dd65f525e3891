//! Coalescing work queue with per-key serialization and delayed retries.
//!
//! A key waiting in the queue is held once. A key handed to a worker is not
//! handed out again until `done`; adding it meanwhile marks it dirty and it is
//! queued again on `done`.

use std::collections::VecDeque;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::backoff::Backoff;

struct State<K> {
    queue: VecDeque<K>,
    queued: FxHashSet<K>,
    processing: FxHashSet<K>,
    dirty: FxHashSet<K>,
    failures: FxHashMap<K, u32>,
    delayed: usize,
    shutdown: bool,
}

struct Shared<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    backoff: Backoff,
    cap: usize,
}

pub struct WorkQueue<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self { Self { shared: Arc::clone(&self.shared) } }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + 'static,
{
    pub fn new(cap: usize, backoff: Backoff) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    queue: VecDeque::with_capacity(cap.min(4096)),
                    queued: FxHashSet::default(),
                    processing: FxHashSet::default(),
                    dirty: FxHashSet::default(),
                    failures: FxHashMap::default(),
                    delayed: 0,
                    shutdown: false,
                }),
                notify: Notify::new(),
                backoff,
                cap: cap.max(1),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<K>> {
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns false when the key was already pending.
    pub fn add(&self, key: K) -> bool {
        let mut st = self.lock();
        if st.shutdown || st.queued.contains(&key) {
            return false;
        }
        if st.processing.contains(&key) {
            return st.dirty.insert(key);
        }
        st.queued.insert(key.clone());
        st.queue.push_back(key);
        let depth = st.queue.len();
        drop(st);
        // Keys are never dropped; the cap only flags a backlog.
        if depth == self.shared.cap {
            warn!(depth, "work queue reached its soft capacity");
        }
        metrics::gauge!("queue_depth", depth as f64);
        self.shared.notify.notify_one();
        true
    }

    /// Next key to process, or `None` once shut down.
    pub async fn next(&self) -> Option<K> {
        loop {
            // Register before checking so a wakeup between check and await is not lost.
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.lock();
                if st.shutdown {
                    return None;
                }
                if let Some(key) = st.queue.pop_front() {
                    st.queued.remove(&key);
                    st.processing.insert(key.clone());
                    let more = !st.queue.is_empty();
                    metrics::gauge!("queue_depth", st.queue.len() as f64);
                    drop(st);
                    if more {
                        self.shared.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Release a key taken with `next`; requeues it if it was added meanwhile.
    pub fn done(&self, key: &K) {
        let mut st = self.lock();
        st.processing.remove(key);
        if st.dirty.remove(key) && !st.shutdown && st.queued.insert(key.clone()) {
            st.queue.push_back(key.clone());
            drop(st);
            self.shared.notify.notify_one();
        }
    }

    /// Clear the failure history of a key after a success.
    pub fn forget(&self, key: &K) { self.lock().failures.remove(key); }

    pub fn failures(&self, key: &K) -> u32 { self.lock().failures.get(key).copied().unwrap_or(0) }

    /// Re-add after the key's backoff delay. Returns the delay chosen.
    pub fn retry(&self, key: K) -> Duration {
        let delay = {
            let mut st = self.lock();
            let n = st.failures.entry(key.clone()).or_insert(0);
            *n = n.saturating_add(1);
            let delay = self.shared.backoff.delay(*n);
            st.delayed += 1;
            delay
        };
        debug!(key = ?key, ?delay, "requeue after backoff");
        let q = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            q.add(key);
            q.lock().delayed -= 1;
        });
        delay
    }

    pub fn len(&self) -> usize { self.lock().queue.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Nothing queued, in flight or waiting on a backoff timer.
    pub fn is_idle(&self) -> bool {
        let st = self.lock();
        st.queue.is_empty() && st.processing.is_empty() && st.delayed == 0
    }

    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let poll = async {
            // Let just-added work be picked up before checking.
            loop {
                tokio::time::sleep(Duration::from_millis(5)).await;
                if self.is_idle() {
                    return;
                }
            }
        };
        tokio::time::timeout(timeout, poll).await.is_ok()
    }

    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.shared.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> WorkQueue<&'static str> {
        WorkQueue::new(16, Backoff::new(Duration::from_millis(1), Duration::from_millis(20)))
    }

    #[tokio::test]
    async fn pending_keys_coalesce() {
        let q = queue();
        assert!(q.add("a"));
        assert!(!q.add("a"));
        assert!(q.add("b"));
        assert_eq!(q.len(), 2);
        assert_eq!(q.next().await, Some("a"));
        assert_eq!(q.next().await, Some("b"));
    }

    #[tokio::test]
    async fn key_in_flight_is_not_handed_out_twice() {
        let q = queue();
        q.add("a");
        let k = q.next().await.unwrap();
        assert!(q.add("a"), "marks dirty");
        assert!(!q.add("a"));
        assert!(q.is_empty(), "dirty key waits for done");
        q.done(&k);
        assert_eq!(q.len(), 1);
        assert_eq!(q.next().await, Some("a"));
        q.done(&"a");
        assert!(q.is_idle());
    }

    #[tokio::test]
    async fn retry_backs_off_and_forget_resets() {
        let q = queue();
        q.add("a");
        let k = q.next().await.unwrap();
        let d1 = q.retry(k);
        q.done(&k);
        assert!(!q.is_idle());
        assert_eq!(q.next().await, Some("a"));
        let d2 = q.retry("a");
        q.done(&"a");
        assert!(d2 >= d1);
        assert_eq!(q.failures(&"a"), 2);
        assert_eq!(q.next().await, Some("a"));
        q.forget(&"a");
        q.done(&"a");
        assert_eq!(q.failures(&"a"), 0);
        assert!(q.wait_idle(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn shutdown_releases_waiters() {
        let q = queue();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.next().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.shutdown();
        assert_eq!(waiter.await.unwrap(), None);
        assert!(!q.add("late"));
    }
}
