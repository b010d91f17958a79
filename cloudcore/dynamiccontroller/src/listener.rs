//! Listeners bind one edge node to changes of one resource.
//!
//! Registered listeners are indexed both by node, so watch reconciliation can compare a node's
//! declared watches with the cloud's, and by resource, so each event handler can find the
//! listeners it feeds.

use crate::{cache::CacheWatcher, filter::Filters, ListOptions};
use ahash::AHashMap as HashMap;
use cloudcore_core::{
    application::parse_key, modules, resource, Application, Gvr, Message, MessageLayer, Operation,
};
use cloudcore_k8s_api::{selector::InvalidSelector, DynamicObject, ResourceExt, Selector};
use cloudcore_k8s_index::{EventType, WatchEvent};
use parking_lot::RwLock;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};
use std::sync::Arc;
use tracing::{debug, trace, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectorListener {
    /// The ID of the watch application that created the listener.
    pub id: String,
    pub node_name: String,
    pub gvr: Gvr,
    pub selector: Selector,
}

#[derive(Clone, Debug, Default)]
pub struct ListenerIndex(Arc<RwLock<Index>>);

type Watchers = HashMap<String, Arc<CacheWatcher>>;

#[derive(Debug, Default)]
struct Index {
    by_node: HashMap<String, Watchers>,
    by_gvr: HashMap<Gvr, Watchers>,
}

#[derive(Debug)]
struct Instrumented(ListenerIndex);

// === impl SelectorListener ===

impl SelectorListener {
    /// Builds the listener for a watch application. A namespaced key restricts the listener to
    /// that namespace.
    pub fn from_application(
        app: &Application,
        options: &ListOptions,
    ) -> Result<Self, InvalidSelector> {
        let (gvr, namespace, _) = parse_key(&app.key);
        let mut selector = Selector::new(&options.label_selector, &options.field_selector)?;
        if !namespace.is_empty() {
            selector.field = selector.field.and_equal("metadata.namespace", namespace);
        }
        Ok(Self {
            id: app.id.clone(),
            node_name: app.nodename.clone(),
            gvr,
            selector,
        })
    }

    pub fn matches(&self, obj: &DynamicObject) -> bool {
        self.selector.matches_object(obj)
    }

    /// Builds the message that delivers `event` to the listener's node, or `None` if the object
    /// does not match the listener.
    pub fn message_for(
        &self,
        event: &WatchEvent<DynamicObject>,
        filters: &Filters,
    ) -> Option<Message> {
        if !self.matches(&event.object) {
            return None;
        }

        let mut obj = event.object.clone();
        filters.apply(&self.node_name, &mut obj);

        let kind = match obj.types.as_ref() {
            Some(types) => types.kind.to_lowercase(),
            None => self.gvr.resource.clone(),
        };
        let ns = resource::namespace_or_null(obj.metadata.namespace.as_deref());
        let res = match resource::build_resource(&self.node_name, ns, &kind, &obj.name_any()) {
            Ok(res) => res,
            Err(error) => {
                warn!(listener = %self.id, %error, "Failed to build message resource");
                return None;
            }
        };
        let op = match event.event_type {
            EventType::Added => Operation::Insert,
            EventType::Modified => Operation::Update,
            EventType::Deleted => Operation::Delete,
        };

        let mut msg = Message::new("").build_router(
            modules::DYNAMIC_CONTROLLER,
            modules::GROUP_RESOURCE,
            res,
            op,
        );
        if let Some(rv) = obj.resource_version() {
            msg = msg.with_resource_version(rv);
        }
        Some(msg.fill_body(&obj))
    }

    /// Sends `event` to the listener's node. Failures are not retried; the node re-watches from
    /// its last seen version.
    pub async fn deliver(
        &self,
        event: &WatchEvent<DynamicObject>,
        messages: &MessageLayer,
        filters: &Filters,
    ) {
        let Some(msg) = self.message_for(event, filters) else {
            trace!(listener = %self.id, name = %event.object.name_any(), "Skipped");
            return;
        };
        let resource = msg.resource().to_string();
        match messages.send(msg).await {
            Ok(()) => debug!(listener = %self.id, %resource, "Sent"),
            Err(error) => warn!(listener = %self.id, %resource, %error, "Failed to send event"),
        }
    }
}

// === impl ListenerIndex ===

impl ListenerIndex {
    /// Indexes a watcher, returning the watcher it replaced, if any.
    pub fn add(&self, watcher: Arc<CacheWatcher>) -> Option<Arc<CacheWatcher>> {
        let listener = watcher.listener();
        let (node, id, gvr) = (
            listener.node_name.clone(),
            listener.id.clone(),
            listener.gvr.clone(),
        );

        let mut index = self.0.write();
        let replaced = index
            .by_node
            .entry(node)
            .or_default()
            .insert(id.clone(), watcher.clone());
        if let Some(prev) = replaced.as_ref() {
            if prev.listener().gvr != gvr {
                index.remove_from_gvr(&prev.listener().gvr, &id);
            }
        }
        index.by_gvr.entry(gvr).or_default().insert(id, watcher);
        replaced
    }

    /// Removes a node's listener from both indexes.
    pub fn remove(&self, node: &str, id: &str) -> Option<Arc<CacheWatcher>> {
        let mut index = self.0.write();
        let watchers = index.by_node.get_mut(node)?;
        let watcher = watchers.remove(id)?;
        if watchers.is_empty() {
            index.by_node.remove(node);
        }
        index.remove_from_gvr(&watcher.listener().gvr, id);
        Some(watcher)
    }

    pub fn for_node(&self, node: &str) -> HashMap<String, SelectorListener> {
        self.0
            .read()
            .by_node
            .get(node)
            .map(|watchers| {
                watchers
                    .iter()
                    .map(|(id, w)| (id.clone(), w.listener().clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn for_gvr(&self, gvr: &Gvr) -> Vec<Arc<CacheWatcher>> {
        self.0
            .read()
            .by_gvr
            .get(gvr)
            .map(|watchers| watchers.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.0.read().by_node.values().map(|watchers| watchers.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn register_metrics(&self, reg: &mut Registry) {
        reg.register_collector(Box::new(Instrumented(self.clone())));
    }
}

// === impl Index ===

impl Index {
    fn remove_from_gvr(&mut self, gvr: &Gvr, id: &str) {
        if let Some(watchers) = self.by_gvr.get_mut(gvr) {
            watchers.remove(id);
            if watchers.is_empty() {
                self.by_gvr.remove(gvr);
            }
        }
    }
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let index = self.0 .0.read();

        let nodes = ConstGauge::new(index.by_node.len() as u32);
        let nodes_encoder = encoder.encode_descriptor(
            "listener_nodes",
            "The number of nodes with at least one listener",
            None,
            MetricType::Gauge,
        )?;
        nodes.encode(nodes_encoder)?;

        let mut listeners_encoder = encoder.encode_descriptor(
            "listeners",
            "The number of listeners per resource",
            None,
            MetricType::Gauge,
        )?;
        for (gvr, watchers) in &index.by_gvr {
            let labels = [
                ("group", gvr.group.as_str()),
                ("version", gvr.version.as_str()),
                ("resource", gvr.resource.as_str()),
            ];
            let size = ConstGauge::new(watchers.len() as u32);
            let size_encoder = listeners_encoder.encode_family(&labels)?;
            size.encode(size_encoder)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{mk_pod, pods_gvr};
    use cloudcore_core::Verb;
    use maplit::btreemap;

    fn mk_listener(node: &str, id: &str, gvr: Gvr) -> SelectorListener {
        SelectorListener {
            id: id.to_string(),
            node_name: node.to_string(),
            gvr,
            selector: Selector::default(),
        }
    }

    #[test]
    fn namespaced_keys_restrict_the_listener() {
        let app = Application::new(
            "edge-1",
            "/core/v1/pods/default/null",
            Verb::Watch,
            Vec::new(),
            Vec::new(),
        );
        let opts = ListOptions {
            label_selector: "app=web".to_string(),
            ..Default::default()
        };
        let listener = SelectorListener::from_application(&app, &opts).unwrap();
        assert_eq!(listener.id, app.id);
        assert_eq!(listener.gvr, pods_gvr());
        assert_eq!(
            listener.selector.to_string(),
            "app=web;metadata.namespace=default"
        );

        let web = btreemap! { "app".to_string() => "web".to_string() };
        assert!(listener.matches(&mk_pod("default", "p", "edge-1", web.clone())));
        assert!(!listener.matches(&mk_pod("other", "p", "edge-1", web)));
        assert!(!listener.matches(&mk_pod("default", "p", "edge-1", Default::default())));
    }

    #[test]
    fn invalid_selectors_are_rejected() {
        let app = Application::new("edge-1", "/core/v1/pods/null/null", Verb::Watch, vec![], vec![]);
        let opts = ListOptions {
            field_selector: "nonsense".to_string(),
            ..Default::default()
        };
        assert!(SelectorListener::from_application(&app, &opts).is_err());
    }

    #[test]
    fn events_become_node_messages() {
        let listener = mk_listener("edge-1", "l1", pods_gvr());
        let filters = Filters::default();
        let pod = mk_pod("default", "p1", "edge-1", Default::default());

        for (event_type, op) in [
            (EventType::Added, Operation::Insert),
            (EventType::Modified, Operation::Update),
            (EventType::Deleted, Operation::Delete),
        ] {
            let msg = listener
                .message_for(
                    &WatchEvent {
                        event_type,
                        object: pod.clone(),
                    },
                    &filters,
                )
                .expect("pod must match");
            assert_eq!(msg.resource(), "node/edge-1/default/pod/p1");
            assert_eq!(msg.operation(), op);
            assert_eq!(msg.router.source, modules::DYNAMIC_CONTROLLER);
            assert_eq!(msg.header.resource_version, "5");
            assert_eq!(msg.content["metadata"]["name"], "p1");
        }

        let mut cluster_scoped = pod.clone();
        cluster_scoped.metadata.namespace = None;
        let msg = listener
            .message_for(
                &WatchEvent {
                    event_type: EventType::Added,
                    object: cluster_scoped,
                },
                &filters,
            )
            .unwrap();
        assert_eq!(msg.resource(), "node/edge-1/null/pod/p1");
    }

    #[test]
    fn field_selectors_drop_other_nodes_pods() {
        let mut listener = mk_listener("edge-1", "l1", pods_gvr());
        listener.selector = ";spec.nodeName=edge-1".parse().unwrap();
        let other = mk_pod("default", "p2", "edge-2", Default::default());
        let event = WatchEvent {
            event_type: EventType::Added,
            object: other,
        };
        assert!(listener.message_for(&event, &Filters::default()).is_none());
    }

    #[tokio::test]
    async fn index_tracks_nodes_and_resources() {
        let index = ListenerIndex::default();
        let deployments = Gvr::new("apps", "v1", "deployments");
        let (a, _a) = CacheWatcher::new(mk_listener("edge-1", "a", pods_gvr()), 1);
        let (b, _b) = CacheWatcher::new(mk_listener("edge-1", "b", deployments.clone()), 1);
        let (c, _c) = CacheWatcher::new(mk_listener("edge-2", "c", pods_gvr()), 1);
        assert!(index.add(a).is_none());
        assert!(index.add(b).is_none());
        assert!(index.add(c).is_none());

        assert_eq!(index.len(), 3);
        let mut ids = index.for_node("edge-1").into_keys().collect::<Vec<_>>();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(index.for_gvr(&pods_gvr()).len(), 2);
        assert!(index.for_node("edge-3").is_empty());

        let removed = index.remove("edge-1", "b").expect("listener must exist");
        assert_eq!(removed.listener().gvr, deployments);
        assert!(index.for_gvr(&deployments).is_empty());
        assert!(index.remove("edge-1", "b").is_none());

        index.remove("edge-2", "c");
        assert_eq!(index.for_gvr(&pods_gvr()).len(), 1);
        assert!(index.0.read().by_node.get("edge-2").is_none());
    }

    #[tokio::test]
    async fn re_adding_an_id_replaces_the_watcher() {
        let index = ListenerIndex::default();
        let (first, _first) = CacheWatcher::new(mk_listener("edge-1", "a", pods_gvr()), 1);
        let deployments = Gvr::new("apps", "v1", "deployments");
        let (second, _second) = CacheWatcher::new(mk_listener("edge-1", "a", deployments.clone()), 1);
        index.add(first.clone());
        let replaced = index.add(second).expect("must replace");
        assert!(Arc::ptr_eq(&replaced, &first));
        assert!(index.for_gvr(&pods_gvr()).is_empty());
        assert_eq!(index.for_gvr(&deployments).len(), 1);
        assert_eq!(index.len(), 1);
    }
}
