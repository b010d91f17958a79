//! Tracks which edge nodes need which configmaps and secrets.
//!
//! Pods scheduled to edge nodes are indexed by the configmaps and secrets they reference, so a
//! change to one of those objects can be fanned out to exactly the nodes that mount it.

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use cloudcore_k8s_api::{self as k8s, ResourceExt};
use parking_lot::Mutex;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::debug;

#[derive(Clone, Debug, Default)]
pub struct LocationCache(Arc<Mutex<Index>>);

type NamespacedName = (String, String);

/// Counts, per referenced object, how many pods on each node reference it.
type Locators = HashMap<NamespacedName, BTreeMap<String, usize>>;

#[derive(Debug, Default)]
struct Index {
    edge_nodes: HashSet<String>,
    configmaps: Locators,
    secrets: Locators,
    pods: HashMap<NamespacedName, PodRefs>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PodRefs {
    node: String,
    configmaps: Vec<String>,
    secrets: Vec<String>,
}

#[derive(Debug)]
struct Instrumented(LocationCache);

// === impl LocationCache ===

impl LocationCache {
    pub fn update_edge_node(&self, name: impl Into<String>) {
        self.0.lock().edge_nodes.insert(name.into());
    }

    /// Forgets a node along with every pod scheduled to it.
    pub fn delete_node(&self, name: &str) {
        let mut index = self.0.lock();
        index.edge_nodes.remove(name);
        let pods = index
            .pods
            .iter()
            .filter(|(_, refs)| refs.node == name)
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        for key in pods {
            index.remove_pod(&key);
        }
    }

    pub fn is_edge_node(&self, name: &str) -> bool {
        self.0.lock().edge_nodes.contains(name)
    }

    pub fn edge_nodes(&self) -> Vec<String> {
        let mut nodes = self.0.lock().edge_nodes.iter().cloned().collect::<Vec<_>>();
        nodes.sort();
        nodes
    }

    /// Records the configmaps and secrets referenced by a pod on an edge node. Pods that are not
    /// scheduled to a known edge node are ignored.
    pub fn add_or_update_pod(&self, pod: &k8s::Pod) {
        let Some(node) = pod.spec.as_ref().and_then(|s| s.node_name.clone()) else {
            return;
        };
        let ns = pod.namespace().unwrap_or_default();
        let key = (ns, pod.name_any());
        let (configmaps, secrets) = k8s::pod_references(pod);
        let refs = PodRefs {
            node,
            configmaps,
            secrets,
        };

        let mut index = self.0.lock();
        if !index.edge_nodes.contains(&refs.node) {
            return;
        }
        if index.pods.get(&key) == Some(&refs) {
            return;
        }
        index.remove_pod(&key);
        index.insert_pod(key, refs);
    }

    /// Forgets a pod's references.
    pub fn delete_pod(&self, namespace: &str, name: &str) {
        self.0
            .lock()
            .remove_pod(&(namespace.to_string(), name.to_string()));
    }

    /// Sorted names of the edge nodes that run a pod referencing the configmap.
    pub fn configmap_nodes(&self, namespace: &str, name: &str) -> Vec<String> {
        nodes(&self.0.lock().configmaps, namespace, name)
    }

    /// Sorted names of the edge nodes that run a pod referencing the secret.
    pub fn secret_nodes(&self, namespace: &str, name: &str) -> Vec<String> {
        nodes(&self.0.lock().secrets, namespace, name)
    }

    pub fn delete_configmap(&self, namespace: &str, name: &str) {
        self.0
            .lock()
            .configmaps
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn delete_secret(&self, namespace: &str, name: &str) {
        self.0
            .lock()
            .secrets
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn register_metrics(&self, reg: &mut Registry) {
        reg.register_collector(Box::new(Instrumented(self.clone())));
    }
}

fn nodes(locators: &Locators, namespace: &str, name: &str) -> Vec<String> {
    locators
        .get(&(namespace.to_string(), name.to_string()))
        .map(|nodes| nodes.keys().cloned().collect())
        .unwrap_or_default()
}

// === impl Index ===

impl Index {
    fn insert_pod(&mut self, key: NamespacedName, refs: PodRefs) {
        let ns = &key.0;
        for cm in &refs.configmaps {
            *self
                .configmaps
                .entry((ns.clone(), cm.clone()))
                .or_default()
                .entry(refs.node.clone())
                .or_default() += 1;
        }
        for secret in &refs.secrets {
            *self
                .secrets
                .entry((ns.clone(), secret.clone()))
                .or_default()
                .entry(refs.node.clone())
                .or_default() += 1;
        }
        debug!(ns = %key.0, pod = %key.1, node = %refs.node, "Indexed pod");
        self.pods.insert(key, refs);
    }

    fn remove_pod(&mut self, key: &NamespacedName) {
        let Some(refs) = self.pods.remove(key) else {
            return;
        };
        for cm in &refs.configmaps {
            release(&mut self.configmaps, (key.0.clone(), cm.clone()), &refs.node);
        }
        for secret in &refs.secrets {
            release(&mut self.secrets, (key.0.clone(), secret.clone()), &refs.node);
        }
    }
}

fn release(locators: &mut Locators, key: NamespacedName, node: &str) {
    let Some(nodes) = locators.get_mut(&key) else {
        return;
    };
    if let Some(count) = nodes.get_mut(node) {
        *count -= 1;
        if *count == 0 {
            nodes.remove(node);
        }
    }
    if nodes.is_empty() {
        locators.remove(&key);
    }
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let index = self.0 .0.lock();

        let nodes = ConstGauge::new(index.edge_nodes.len() as u32);
        let nodes_encoder = encoder.encode_descriptor(
            "location_edge_nodes",
            "The number of edge nodes in the location cache",
            None,
            MetricType::Gauge,
        )?;
        nodes.encode(nodes_encoder)?;

        let pods = ConstGauge::new(index.pods.len() as u32);
        let pods_encoder = encoder.encode_descriptor(
            "location_pods",
            "The number of edge pods in the location cache",
            None,
            MetricType::Gauge,
        )?;
        pods.encode(pods_encoder)?;

        let mut locators_encoder = encoder.encode_descriptor(
            "location_locators",
            "The number of configmaps and secrets referenced by edge pods",
            None,
            MetricType::Gauge,
        )?;
        for (kind, locators) in [("configmap", &index.configmaps), ("secret", &index.secrets)] {
            let labels = [("kind", kind)];
            let size = ConstGauge::new(locators.len() as u32);
            let size_encoder = locators_encoder.encode_family(&labels)?;
            size.encode(size_encoder)?;
        }
        Ok(())
    }
}
