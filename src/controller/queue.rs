//! Deduplicating work queue
//!
//! A key is queued at most once. A key added while a worker is processing it
//! is marked dirty and requeued when that worker calls `done`, so one request
//! never runs on two workers at the same time.

use crate::models::RequestKey;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

#[derive(Default)]
struct QueueState {
    queue: VecDeque<RequestKey>,
    queued: HashSet<RequestKey>,
    processing: HashSet<RequestKey>,
    dirty: HashSet<RequestKey>,
    shutdown: bool,
}

#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, key: RequestKey) {
        let mut state = self.state.lock().await;
        if state.shutdown {
            return;
        }
        if state.processing.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.queue.push_back(key);
            self.notify.notify_one();
        }
    }

    /// Add `key` once `delay` has elapsed
    pub fn add_after(self: &Arc<Self>, key: RequestKey, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key).await;
        });
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn next(&self) -> Option<RequestKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if state.shutdown {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Finish processing `key`, requeueing it if it was added meanwhile
    pub async fn done(&self, key: &RequestKey) {
        let mut state = self.state.lock().await;
        state.processing.remove(key);
        if state.dirty.remove(key) && !state.shutdown && state.queued.insert(key.clone()) {
            state.queue.push_back(key.clone());
            self.notify.notify_one();
        }
    }

    pub async fn shutdown(&self) {
        self.state.lock().await.shutdown = true;
        self.notify.notify_waiters();
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.queue.len()
    }
}
