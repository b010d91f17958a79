//! Per-resource event handlers that fan informer events out to listeners.
//!
//! A handler is created the first time a listener registers for a resource. It owns the only
//! subscription to that resource's informer and, with the cacher engine, records every event in a
//! [`WatchCache`] so that later listeners can resume from a version.

use crate::{
    cache::{event_rv, CacheWatcher, WatchCache, WatchCacheError},
    filter::Filters,
    listener::{ListenerIndex, SelectorListener},
    ListOptions,
};
use ahash::AHashMap as HashMap;
use cloudcore_core::{config::WatchEngine, Config, Gvr, MessageLayer};
use cloudcore_k8s_api::{ApiResource, DynamicObject, ResourceExt};
use cloudcore_k8s_index::{
    object_key, store::stamp_types, DynamicInformer, EventType, InformerSource, Lister, WatchEvent,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, trace, Instrument};

#[derive(Clone)]
pub struct HandlerCenter {
    inner: Arc<Inner>,
}

struct Inner {
    informers: Arc<dyn InformerSource>,
    listeners: ListenerIndex,
    messages: MessageLayer,
    filters: Filters,
    engine: WatchEngine,
    buffer: usize,
    handlers: Mutex<HashMap<Gvr, Handler>>,
    drain: drain::Watch,
}

#[derive(Clone)]
struct Handler {
    informer: DynamicInformer,
    cache: Option<Arc<WatchCache>>,
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("failed to start informer for {gvr}: {error:#}")]
    Informer { gvr: Gvr, error: anyhow::Error },

    #[error(transparent)]
    Expired(#[from] WatchCacheError),
}

// === impl HandlerCenter ===

impl HandlerCenter {
    pub fn new(
        informers: Arc<dyn InformerSource>,
        messages: MessageLayer,
        filters: Filters,
        config: &Config,
        drain: drain::Watch,
    ) -> Self {
        Self::with_listeners(
            ListenerIndex::default(),
            informers,
            messages,
            filters,
            config,
            drain,
        )
    }

    /// Builds a handler center around an existing listener index, e.g. one whose metrics were
    /// registered before the API client was available.
    pub fn with_listeners(
        listeners: ListenerIndex,
        informers: Arc<dyn InformerSource>,
        messages: MessageLayer,
        filters: Filters,
        config: &Config,
        drain: drain::Watch,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                informers,
                listeners,
                messages,
                filters,
                engine: config.watch_engine,
                buffer: config.handler_buffer(),
                handlers: Default::default(),
                drain,
            }),
        }
    }

    /// Registers a listener, replacing any listener with the same ID on the same node, and starts
    /// delivering events to it.
    ///
    /// The listener first receives the objects it has not yet observed: with the cacher engine and
    /// a resume version, the cached events newer than that version, or while the window is still
    /// empty, a synthetic `Added` event for every matching object newer than that version;
    /// otherwise a synthetic `Added` event for every cached object matching its label selector.
    pub async fn add_listener(
        &self,
        listener: SelectorListener,
        options: &ListOptions,
    ) -> Result<(), HandlerError> {
        let handler = self.for_resource(&listener.gvr).await?;

        let (watcher, feed) = CacheWatcher::new(listener.clone(), self.inner.buffer);
        if let Some(prev) = self.inner.listeners.add(watcher.clone()) {
            prev.stop();
        }

        let lister = handler.informer.informer.lister();
        let resource = &handler.informer.resource;
        let (init, rv) = match (handler.cache.as_ref(), options.resume_version()) {
            (Some(cache), Some(rv)) if !cache.is_empty() => match cache.get_all_events_since(rv) {
                Ok(events) => (events, Some(rv)),
                Err(error) => {
                    self.inner
                        .listeners
                        .remove(&listener.node_name, &listener.id);
                    watcher.stop();
                    return Err(error.into());
                }
            },
            // A new window has no history yet; the cached objects changed since the version stand
            // in for it.
            (Some(_), Some(rv)) => (resumed_events(&lister, resource, &listener, rv), Some(rv)),
            _ => (initial_events(&lister, resource, &listener), None),
        };
        debug!(
            listener = %listener.id,
            node = %listener.node_name,
            resource = %listener.gvr,
            init = init.len(),
            "Added listener"
        );

        let span = info_span!(
            "listener",
            id = %listener.id,
            node = %listener.node_name,
            resource = %listener.gvr,
        );
        tokio::spawn(
            feed.process_events(
                init,
                rv,
                self.inner.messages.clone(),
                self.inner.filters.clone(),
                self.inner.drain.clone(),
            )
            .instrument(span),
        );
        Ok(())
    }

    /// Removes a node's listener and stops its delivery. Returns false if it was not registered.
    pub fn delete_listener(&self, node: &str, id: &str) -> bool {
        match self.inner.listeners.remove(node, id) {
            Some(watcher) => {
                watcher.stop();
                debug!(listener = %id, %node, "Deleted listener");
                true
            }
            None => false,
        }
    }

    pub fn listeners_for_node(&self, node: &str) -> HashMap<String, SelectorListener> {
        self.inner.listeners.for_node(node)
    }

    pub fn listeners(&self) -> &ListenerIndex {
        &self.inner.listeners
    }

    async fn for_resource(&self, gvr: &Gvr) -> Result<Handler, HandlerError> {
        if let Some(handler) = self.inner.handlers.lock().get(gvr).cloned() {
            return Ok(handler);
        }

        let informer = self
            .inner
            .informers
            .informer(gvr)
            .await
            .map_err(|error| HandlerError::Informer {
                gvr: gvr.clone(),
                error,
            })?;

        let mut handlers = self.inner.handlers.lock();
        // Another listener may have started the handler while the informer synced.
        if let Some(handler) = handlers.get(gvr) {
            return Ok(handler.clone());
        }
        let cache = match self.inner.engine {
            WatchEngine::Cacher => Some(Arc::new(WatchCache::default())),
            WatchEngine::Simple => None,
        };
        let events = informer.informer.add_handler(self.inner.buffer);
        let handler = Handler { informer, cache };
        handlers.insert(gvr.clone(), handler.clone());
        drop(handlers);

        info!(resource = %gvr, "Starting handler");
        tokio::spawn(
            dispatch(
                events,
                handler.informer.resource.clone(),
                handler.cache.clone(),
                self.inner.listeners.clone(),
                gvr.clone(),
                self.inner.drain.clone(),
            )
            .instrument(info_span!("handler", resource = %gvr)),
        );
        Ok(handler)
    }
}

impl std::fmt::Debug for HandlerCenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerCenter")
            .field("engine", &self.inner.engine)
            .field("handlers", &self.inner.handlers.lock().len())
            .field("listeners", &self.inner.listeners.len())
            .finish()
    }
}

/// Delivers every informer event, in order, to each listener of the resource.
async fn dispatch(
    mut events: mpsc::Receiver<WatchEvent<DynamicObject>>,
    resource: ApiResource,
    cache: Option<Arc<WatchCache>>,
    listeners: ListenerIndex,
    gvr: Gvr,
    drain: drain::Watch,
) {
    let shutdown = drain.signaled();
    tokio::pin!(shutdown);
    loop {
        let mut event = tokio::select! {
            _ = &mut shutdown => return,
            event = events.recv() => match event {
                Some(event) => event,
                None => {
                    debug!("Informer closed");
                    return;
                }
            },
        };
        stamp_types(&mut event.object, &resource);

        if let Some(cache) = cache.as_ref() {
            match event_rv(&event) {
                Some(rv) => cache.add(event.clone(), rv),
                None => debug!(name = %event.object.name_any(), "Event without a resource version"),
            }
        }

        for watcher in listeners.for_gvr(&gvr) {
            if !watcher.send(event.clone()).await {
                trace!(listener = %watcher.listener().id, "Listener stopped");
            }
        }
    }
}

/// Objects fetched from the informer may omit their type.
fn initial_events(
    lister: &Lister<DynamicObject>,
    resource: &ApiResource,
    listener: &SelectorListener,
) -> Vec<WatchEvent<DynamicObject>> {
    let mut objects = lister
        .list()
        .into_iter()
        .filter(|obj| listener.selector.label.matches(obj.labels()))
        .collect::<Vec<_>>();
    objects.sort_by_key(object_key);
    objects
        .into_iter()
        .map(|mut object| {
            stamp_types(&mut object, resource);
            WatchEvent {
                event_type: EventType::Added,
                object,
            }
        })
        .collect()
}

/// The synthetic events for objects changed after `rv`, oldest first.
fn resumed_events(
    lister: &Lister<DynamicObject>,
    resource: &ApiResource,
    listener: &SelectorListener,
    rv: u64,
) -> Vec<WatchEvent<DynamicObject>> {
    let mut events = initial_events(lister, resource, listener)
        .into_iter()
        .filter(|event| event_rv(event).is_some_and(|ev_rv| ev_rv > rv))
        .collect::<Vec<_>>();
    events.sort_by_key(event_rv);
    events
}
