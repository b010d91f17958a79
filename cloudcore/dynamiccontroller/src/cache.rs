//! A sliding window of recent events per resource, and the per-listener watchers fed from it.
//!
//! The window lets a node that reconnects resume its watch from the last version it observed,
//! provided that version is still retained; older versions are reported as expired so the node
//! relists instead.

use crate::{filter::Filters, listener::SelectorListener};
use cloudcore_core::MessageLayer;
use cloudcore_k8s_api::{DynamicObject, ResourceExt};
use cloudcore_k8s_index::WatchEvent;
use parking_lot::Mutex;
use std::{collections::VecDeque, sync::Arc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

pub const DEFAULT_CAPACITY: usize = 1024;

/// A bounded, version-ordered window of the events observed for one resource.
#[derive(Debug)]
pub struct WatchCache {
    capacity: usize,
    events: Mutex<VecDeque<Entry>>,
}

#[derive(Clone, Debug)]
struct Entry {
    rv: u64,
    event: WatchEvent<DynamicObject>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum WatchCacheError {
    #[error("too old resource version: {requested} ({oldest})")]
    ResourceExpired { requested: u64, oldest: u64 },
}

/// The sending half of a listener's event queue.
#[derive(Debug)]
pub struct CacheWatcher {
    listener: SelectorListener,
    tx: mpsc::Sender<WatchEvent<DynamicObject>>,
    stop: Mutex<Option<oneshot::Sender<()>>>,
}

/// The receiving half of a listener's event queue; consumed by [`WatchFeed::process_events`].
#[derive(Debug)]
pub struct WatchFeed {
    listener: SelectorListener,
    rx: mpsc::Receiver<WatchEvent<DynamicObject>>,
    stopped: oneshot::Receiver<()>,
}

/// Parses an object's resource version, if it has a numeric one.
pub fn event_rv(event: &WatchEvent<DynamicObject>) -> Option<u64> {
    event.object.resource_version()?.parse().ok()
}

// === impl WatchCache ===

impl WatchCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            events: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Records an event, evicting the oldest one when the window is full.
    pub fn add(&self, event: WatchEvent<DynamicObject>, rv: u64) {
        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(Entry { rv, event });
    }

    /// Returns every retained event newer than `rv`, oldest first.
    ///
    /// A version immediately preceding the oldest retained event is still serviceable, since
    /// nothing was evicted between it and the window.
    pub fn get_all_events_since(
        &self,
        rv: u64,
    ) -> Result<Vec<WatchEvent<DynamicObject>>, WatchCacheError> {
        let events = self.events.lock();
        let Some(oldest) = events.front().map(|e| e.rv) else {
            return Ok(Vec::new());
        };
        if rv < oldest.saturating_sub(1) {
            return Err(WatchCacheError::ResourceExpired {
                requested: rv,
                oldest,
            });
        }
        let start = events.partition_point(|e| e.rv <= rv);
        Ok(events.range(start..).map(|e| e.event.clone()).collect())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for WatchCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// === impl CacheWatcher ===

impl CacheWatcher {
    pub fn new(listener: SelectorListener, capacity: usize) -> (Arc<Self>, WatchFeed) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (stop, stopped) = oneshot::channel();
        let watcher = Arc::new(Self {
            listener: listener.clone(),
            tx,
            stop: Mutex::new(Some(stop)),
        });
        let feed = WatchFeed {
            listener,
            rx,
            stopped,
        };
        (watcher, feed)
    }

    pub fn listener(&self) -> &SelectorListener {
        &self.listener
    }

    /// Queues an event for the listener, waiting for capacity. Returns false once the watcher has
    /// stopped.
    pub async fn send(&self, event: WatchEvent<DynamicObject>) -> bool {
        if self.is_stopped() {
            return false;
        }
        self.tx.send(event).await.is_ok()
    }

    /// Stops the watcher's feed. Stopping more than once has no further effect.
    pub fn stop(&self) {
        if let Some(stop) = self.stop.lock().take() {
            debug!(listener = %self.listener.id, node = %self.listener.node_name, "Stopping");
            let _ = stop.send(());
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.lock().is_none()
    }
}

// === impl WatchFeed ===

impl WatchFeed {
    /// Delivers `init` and then every queued event to the listener's node until the watcher is
    /// stopped or the process shuts down.
    ///
    /// When resuming from `rv`, queued events at or below the newest version already delivered
    /// are dropped so that events recorded while backfilling are not sent twice.
    pub async fn process_events(
        mut self,
        init: Vec<WatchEvent<DynamicObject>>,
        mut rv: Option<u64>,
        messages: MessageLayer,
        filters: Filters,
        drain: drain::Watch,
    ) {
        for event in &init {
            self.listener.deliver(event, &messages, &filters).await;
        }
        if let (Some(current), Some(last)) = (rv, init.last().and_then(event_rv)) {
            rv = Some(current.max(last));
        }

        let shutdown = drain.signaled();
        tokio::pin!(shutdown);
        loop {
            let event = tokio::select! {
                biased;
                _ = &mut shutdown => return,
                _ = &mut self.stopped => {
                    debug!(listener = %self.listener.id, "Stopped");
                    return;
                }
                event = self.rx.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };

            if let (Some(current), Some(ev_rv)) = (rv, event_rv(&event)) {
                if ev_rv <= current {
                    trace!(listener = %self.listener.id, rv = ev_rv, "Already delivered");
                    continue;
                }
                rv = Some(ev_rv);
            }
            self.listener.deliver(&event, &messages, &filters).await;
        }
    }
}
