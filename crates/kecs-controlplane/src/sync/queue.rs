//! De-duplicating work queue with per-key serialization
//!
//! A key is handed to at most one worker at a time. Adding a key that is
//! already queued is a no-op; adding a key that is being processed marks it
//! dirty, and [`WorkQueue::done`] puts it back on the queue.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

struct QueueState<K> {
    queue: VecDeque<K>,
    /// Keys that need processing (queued, or re-added while in flight)
    dirty: HashSet<K>,
    processing: HashSet<K>,
    requeues: HashMap<K, u32>,
    shutdown: bool,
}

pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                requeues: HashMap::new(),
                shutdown: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Mark a key as needing work
    pub fn add(&self, key: K) {
        {
            let mut state = self.state.lock();
            if state.shutdown || state.dirty.contains(&key) {
                return;
            }
            state.dirty.insert(key.clone());
            if state.processing.contains(&key) {
                return;
            }
            state.queue.push_back(key);
        }
        self.notify.notify_one();
    }

    /// Add a key once `delay` has passed
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Wait for the next key; `None` once the queue is shut down
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.shutdown {
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

    /// Finish processing a key, re-queueing it if it was re-added meanwhile
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut state = self.state.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) && !state.shutdown {
                state.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Count a retry for a key and return the new total
    pub fn record_requeue(&self, key: &K) -> u32 {
        let mut state = self.state.lock();
        let count = state.requeues.entry(key.clone()).or_insert(0);
        *count += 1;
        *count
    }

    /// Reset the retry count for a key
    pub fn forget(&self, key: &K) {
        self.state.lock().requeues.remove(key);
    }

    /// Stop handing out keys and wake every waiting worker
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.notify.notify_waiters();
    }

    /// Keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_processing(&self, key: &K) -> bool {
        self.state.lock().processing.contains(key)
    }
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
