use ahash::AHashSet as HashSet;
use cloudcore_k8s_index::ObjectKey;
use parking_lot::Mutex;
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tokio::sync::Notify;

/// A FIFO of access objects awaiting reconciliation. A key that is already queued is not queued
/// again; a key re-added while it is being reconciled is.
#[derive(Clone, Debug, Default)]
pub struct WorkQueue(Arc<Inner>);

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Debug, Default)]
struct State {
    pending: VecDeque<ObjectKey>,
    queued: HashSet<ObjectKey>,
}

// === impl WorkQueue ===

impl WorkQueue {
    pub fn add(&self, key: ObjectKey) {
        let mut state = self.0.state.lock();
        if state.queued.insert(key.clone()) {
            state.pending.push_back(key);
            drop(state);
            self.0.notify.notify_one();
        }
    }

    pub fn add_after(&self, key: ObjectKey, delay: Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Waits for the next key.
    pub async fn next(&self) -> ObjectKey {
        loop {
            if let Some(key) = self.try_next() {
                return key;
            }
            self.0.notify.notified().await;
        }
    }

    pub fn try_next(&self) -> Option<ObjectKey> {
        let mut state = self.0.state.lock();
        let key = state.pending.pop_front()?;
        state.queued.remove(&key);
        Some(key)
    }

    pub fn len(&self) -> usize {
        self.0.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
