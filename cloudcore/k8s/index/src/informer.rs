//! A cache of watched objects that fans typed change events out to registered handlers.
//!
//! Objects are cached in a [`reflector::Store`](Store). Each watch event is compared against the
//! store before it is written, so handlers can distinguish creations from updates and observe
//! deletions that happened while the watch was disconnected.

use ahash::AHashMap as HashMap;
use cloudcore_k8s_api::{Event, Resource, ResourceExt};
use futures::prelude::*;
use kube::runtime::reflector::{store::Writer, ObjectRef, Store};
use parking_lot::{Mutex, RwLock};
use std::{hash::Hash, sync::Arc};
use tokio::sync::mpsc;
use tracing::{debug, trace};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WatchEvent<K> {
    pub event_type: EventType,
    pub object: K,
}

/// `(namespace, name)`; the namespace is empty for cluster-scoped objects.
pub type ObjectKey = (String, String);

pub struct Informer<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Clone + Eq + Hash,
{
    inner: Arc<Inner<K>>,
}

/// Read access to an informer's cache.
pub struct Lister<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Clone + Eq + Hash,
{
    store: Store<K>,
    dyntype: K::DynamicType,
}

struct Inner<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Clone + Eq + Hash,
{
    reflector: Mutex<Reflector<K>>,
    store: Store<K>,
    dyntype: K::DynamicType,
    handlers: RwLock<Vec<mpsc::Sender<WatchEvent<K>>>>,
}

struct Reflector<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Clone + Eq + Hash,
{
    writer: Writer<K>,
    /// Objects of the listing in progress; the store is only replaced once it completes.
    relist: Vec<K>,
}

pub fn object_key<K: ResourceExt>(obj: &K) -> ObjectKey {
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

// === impl Informer ===

impl<K> Informer<K>
where
    K: Resource + Clone + Send + Sync + 'static,
    K::DynamicType: Clone + Default + Eq + Hash,
{
    pub fn new() -> Self {
        Self::with_dyntype(Default::default())
    }
}

impl<K> Informer<K>
where
    K: Resource + Clone + Send + Sync + 'static,
    K::DynamicType: Clone + Eq + Hash,
{
    /// Creates an informer for a resource whose type is only known at runtime.
    pub fn with_dyntype(dyntype: K::DynamicType) -> Self {
        let writer = Writer::new(dyntype.clone());
        let store = writer.as_reader();
        Self {
            inner: Arc::new(Inner {
                reflector: Mutex::new(Reflector {
                    writer,
                    relist: Vec::new(),
                }),
                store,
                dyntype,
                handlers: Default::default(),
            }),
        }
    }

    pub fn lister(&self) -> Lister<K> {
        Lister {
            store: self.inner.store.clone(),
            dyntype: self.inner.dyntype.clone(),
        }
    }

    /// Registers a handler. Events are delivered in order; a full handler queue blocks delivery to
    /// every handler of this informer.
    pub fn add_handler(&self, capacity: usize) -> mpsc::Receiver<WatchEvent<K>> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.inner.handlers.write().push(tx);
        rx
    }

    /// Waits until the initial listing has been applied.
    pub async fn wait_for_sync(&self) {
        if self.inner.store.wait_until_ready().await.is_err() {
            debug!("Informer dropped before syncing");
        }
    }

    /// Applies a watch event to the cache and returns the events handlers should observe.
    pub fn apply(&self, event: Event<K>) -> Vec<WatchEvent<K>> {
        let mut reflector = self.inner.reflector.lock();
        let changes = match &event {
            Event::Apply(obj) => {
                let event_type = match self.inner.store.get(&self.obj_ref(obj)) {
                    Some(_) => EventType::Modified,
                    None => EventType::Added,
                };
                vec![WatchEvent {
                    event_type,
                    object: obj.clone(),
                }]
            }

            Event::Delete(obj) => vec![WatchEvent {
                event_type: EventType::Deleted,
                object: obj.clone(),
            }],

            Event::Init => {
                reflector.relist.clear();
                vec![]
            }

            Event::InitApply(obj) => {
                reflector.relist.push(obj.clone());
                vec![]
            }

            Event::InitDone => {
                let relisted = std::mem::take(&mut reflector.relist);
                self.diff_relist(relisted)
            }
        };
        reflector.writer.apply_watcher_event(&event);
        changes
    }

    /// Compares a completed listing with the store.
    fn diff_relist(&self, relisted: Vec<K>) -> Vec<WatchEvent<K>> {
        let mut previous = self
            .inner
            .store
            .state()
            .into_iter()
            .map(|obj| (self.obj_ref(&obj), obj))
            .collect::<HashMap<_, _>>();

        let mut changes = Vec::with_capacity(relisted.len());
        for obj in relisted {
            match previous.remove(&self.obj_ref(&obj)) {
                None => changes.push(WatchEvent {
                    event_type: EventType::Added,
                    object: obj,
                }),
                Some(prev) if prev.resource_version() != obj.resource_version() => {
                    changes.push(WatchEvent {
                        event_type: EventType::Modified,
                        object: obj,
                    })
                }
                Some(_) => trace!(name = %obj.name_any(), "Unchanged"),
            }
        }
        changes.extend(previous.into_values().map(|obj| WatchEvent {
            event_type: EventType::Deleted,
            object: K::clone(&obj),
        }));
        changes
    }

    fn obj_ref(&self, obj: &K) -> ObjectRef<K> {
        ObjectRef::from_obj_with(obj, self.inner.dyntype.clone())
    }

    /// Applies events from `events` until the stream ends, delivering changes to every handler.
    pub async fn run(self, events: impl Stream<Item = Event<K>> + Send) {
        tokio::pin!(events);
        while let Some(event) = events.next().await {
            let changes = self.apply(event);
            self.dispatch(changes).await;
        }
        debug!("Watch ended");
    }

    async fn dispatch(&self, changes: Vec<WatchEvent<K>>) {
        if changes.is_empty() {
            return;
        }
        let handlers = self.inner.handlers.read().clone();
        let mut closed = false;
        for change in changes {
            for tx in &handlers {
                closed |= tx.send(change.clone()).await.is_err();
            }
        }
        if closed {
            self.inner.handlers.write().retain(|tx| !tx.is_closed());
        }
    }
}

impl<K> Default for Informer<K>
where
    K: Resource + Clone + Send + Sync + 'static,
    K::DynamicType: Clone + Default + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Clone for Informer<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Clone + Eq + Hash,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> std::fmt::Debug for Informer<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Clone + Eq + Hash,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Informer")
            .field("objects", &self.inner.store.state().len())
            .field("handlers", &self.inner.handlers.read().len())
            .finish()
    }
}

// === impl Lister ===

impl<K> Lister<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Clone + Eq + Hash,
{
    pub fn get(&self, namespace: &str, name: &str) -> Option<K> {
        let mut key = ObjectRef::new_with(name, self.dyntype.clone());
        if !namespace.is_empty() {
            key = key.within(namespace);
        }
        self.store.get(&key).map(|obj| K::clone(&obj))
    }

    pub fn list(&self) -> Vec<K> {
        self.store
            .state()
            .into_iter()
            .map(|obj| K::clone(&obj))
            .collect()
    }

    pub fn list_namespace(&self, namespace: &str) -> Vec<K> {
        self.store
            .state()
            .into_iter()
            .filter(|obj| obj.meta().namespace.as_deref().unwrap_or_default() == namespace)
            .map(|obj| K::clone(&obj))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.store.state().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K> Clone for Lister<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Clone + Eq + Hash,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            dyntype: self.dyntype.clone(),
        }
    }
}

impl<K> std::fmt::Debug for Lister<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Clone + Eq + Hash,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lister")
            .field("objects", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudcore_k8s_api::{ApiResource, ConfigMap, DynamicObject, ObjectMeta};
    use k8s_openapi::api::core::v1::Namespace;
    use tokio::time;

    fn mk_cm(name: &str, rv: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                namespace: Some("default".to_string()),
                name: Some(name.to_string()),
                resource_version: Some(rv.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn types(events: &[WatchEvent<ConfigMap>]) -> Vec<(EventType, String)> {
        let mut types = events
            .iter()
            .map(|e| (e.event_type, e.object.name_any()))
            .collect::<Vec<_>>();
        types.sort_by(|a, b| a.1.cmp(&b.1));
        types
    }

    async fn is_synced<K>(informer: &Informer<K>) -> bool
    where
        K: Resource + Clone + Send + Sync + 'static,
        K::DynamicType: Clone + Eq + Hash,
    {
        time::timeout(time::Duration::from_millis(10), informer.wait_for_sync())
            .await
            .is_ok()
    }

    #[test]
    fn classifies_applies() {
        let informer = Informer::<ConfigMap>::new();
        let events = informer.apply(Event::Apply(mk_cm("a", "1")));
        assert_eq!(types(&events), vec![(EventType::Added, "a".to_string())]);
        let events = informer.apply(Event::Apply(mk_cm("a", "2")));
        assert_eq!(types(&events), vec![(EventType::Modified, "a".to_string())]);
        assert_eq!(
            informer.lister().get("default", "a").unwrap().metadata.resource_version,
            Some("2".to_string())
        );
        let events = informer.apply(Event::Delete(mk_cm("a", "2")));
        assert_eq!(types(&events), vec![(EventType::Deleted, "a".to_string())]);
        assert!(informer.lister().is_empty());
    }

    #[tokio::test]
    async fn relist_reconciles_cache() {
        let informer = Informer::<ConfigMap>::new();
        informer.apply(Event::Apply(mk_cm("kept", "1")));
        informer.apply(Event::Apply(mk_cm("changed", "1")));
        informer.apply(Event::Apply(mk_cm("gone", "1")));
        assert!(!is_synced(&informer).await);

        assert!(informer.apply(Event::Init).is_empty());
        assert!(informer.apply(Event::InitApply(mk_cm("kept", "1"))).is_empty());
        assert!(informer.apply(Event::InitApply(mk_cm("changed", "2"))).is_empty());
        assert!(informer.apply(Event::InitApply(mk_cm("new", "1"))).is_empty());
        // The store keeps serving the previous objects while the listing is in progress.
        assert!(informer.lister().get("default", "gone").is_some());
        let events = informer.apply(Event::InitDone);

        assert_eq!(
            types(&events),
            vec![
                (EventType::Modified, "changed".to_string()),
                (EventType::Deleted, "gone".to_string()),
                (EventType::Added, "new".to_string()),
            ]
        );
        assert!(is_synced(&informer).await);
        let lister = informer.lister();
        assert_eq!(lister.len(), 3);
        assert!(lister.get("default", "gone").is_none());
        assert_eq!(lister.list_namespace("default").len(), 3);
        assert!(lister.list_namespace("other").is_empty());
    }

    #[test]
    fn cluster_scoped_objects_have_no_namespace() {
        let informer = Informer::<Namespace>::new();
        informer.apply(Event::Apply(Namespace {
            metadata: ObjectMeta {
                name: Some("kubeedge".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }));
        let lister = informer.lister();
        assert!(lister.get("", "kubeedge").is_some());
        assert_eq!(lister.list_namespace("").len(), 1);
    }

    #[test]
    fn dynamic_objects_are_keyed_by_their_resource() {
        let resource = ApiResource::erase::<ConfigMap>(&());
        let informer = Informer::<DynamicObject>::with_dyntype(resource.clone());
        let obj = DynamicObject::new("a", &resource).within("default");
        let events = informer.apply(Event::Apply(obj.clone()));
        assert_eq!(events[0].event_type, EventType::Added);
        assert_eq!(informer.lister().get("default", "a"), Some(obj));
    }

    #[tokio::test]
    async fn delivers_to_handlers() {
        let informer = Informer::<ConfigMap>::new();
        let mut rx = informer.add_handler(4);
        let dropped = informer.add_handler(1);
        drop(dropped);

        let events = futures::stream::iter(vec![
            Event::Init,
            Event::InitApply(mk_cm("a", "1")),
            Event::InitDone,
            Event::Apply(mk_cm("a", "2")),
        ]);
        tokio::spawn(informer.clone().run(events));

        informer.wait_for_sync().await;
        let ev = time::timeout(time::Duration::from_secs(1), rx.recv())
            .await
            .expect("must not time out")
            .expect("must receive");
        assert_eq!(ev.event_type, EventType::Added);
        let ev = time::timeout(time::Duration::from_secs(1), rx.recv())
            .await
            .expect("must not time out")
            .expect("must receive");
        assert_eq!(ev.event_type, EventType::Modified);
        assert_eq!(ev.object.resource_version().as_deref(), Some("2"));
    }
}
