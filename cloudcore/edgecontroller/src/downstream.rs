//! Projects cluster state onto edge nodes.
//!
//! One loop per watched kind turns informer events into messages addressed to the nodes that need
//! them: pods go to the node they are scheduled on, configmaps and secrets fan out to every node
//! running a pod that references them, and rules are handed to the router.

use cloudcore_core::{modules, resource, Message, MessageLayer, Operation};
use cloudcore_k8s_api::{
    self as k8s,
    rules::{Rule, RuleEndpoint},
    ResourceExt,
};
use cloudcore_k8s_index::{EventType, LocationCache, WatchEvent};
use futures::future::BoxFuture;
use serde::Serialize;
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, info_span, trace, warn, Instrument};

/// Node-scoped messages carry a placeholder namespace.
const NODE_NAMESPACE: &str = "namespace";

#[derive(Clone, Debug)]
pub struct Downstream {
    messages: MessageLayer,
    locations: LocationCache,
    role_label: Arc<str>,
}

/// Event queues for each kind the downstream controller watches.
#[derive(Debug)]
pub struct Events {
    pub pods: mpsc::Receiver<WatchEvent<k8s::Pod>>,
    pub configmaps: mpsc::Receiver<WatchEvent<k8s::ConfigMap>>,
    pub secrets: mpsc::Receiver<WatchEvent<k8s::Secret>>,
    pub nodes: mpsc::Receiver<WatchEvent<k8s::Node>>,
    pub rules: mpsc::Receiver<WatchEvent<Rule>>,
    pub rule_endpoints: mpsc::Receiver<WatchEvent<RuleEndpoint>>,
}

// === impl Downstream ===

impl Downstream {
    pub fn new(messages: MessageLayer, locations: LocationCache, role_label: &str) -> Self {
        Self {
            messages,
            locations,
            role_label: role_label.into(),
        }
    }

    /// Seeds the location cache with the current edge nodes and the pods scheduled to them.
    pub fn prime<'a>(
        &self,
        nodes: impl IntoIterator<Item = &'a k8s::Node>,
        pods: impl IntoIterator<Item = &'a k8s::Pod>,
    ) {
        for node in nodes {
            if k8s::is_edge_node(node, &self.role_label) {
                self.locations.update_edge_node(node.name_any());
            }
        }
        for pod in pods {
            self.locations.add_or_update_pod(pod);
        }
        info!(nodes = self.locations.edge_nodes().len(), "Primed location cache");
    }

    /// Spawns one loop per kind. Each loop ends when its queue closes or on shutdown.
    pub fn spawn(self, events: Events, drain: drain::Watch) -> Vec<JoinHandle<()>> {
        let Events {
            pods,
            configmaps,
            secrets,
            nodes,
            rules,
            rule_endpoints,
        } = events;
        let this = Arc::new(self);
        vec![
            spawn_loop("pods", pods, drain.clone(), this.clone(), |dc, ev| {
                Box::pin(async move { dc.handle_pod(ev).await })
            }),
            spawn_loop("configmaps", configmaps, drain.clone(), this.clone(), |dc, ev| {
                Box::pin(async move { dc.handle_configmap(ev).await })
            }),
            spawn_loop("secrets", secrets, drain.clone(), this.clone(), |dc, ev| {
                Box::pin(async move { dc.handle_secret(ev).await })
            }),
            spawn_loop("nodes", nodes, drain.clone(), this.clone(), |dc, ev| {
                Box::pin(async move { dc.handle_node(ev).await })
            }),
            spawn_loop("rules", rules, drain.clone(), this.clone(), |dc, ev| {
                Box::pin(async move { dc.handle_rule(ev).await })
            }),
            spawn_loop("ruleendpoints", rule_endpoints, drain, this, |dc, ev| {
                Box::pin(async move { dc.handle_rule_endpoint(ev).await })
            }),
        ]
    }

    pub async fn handle_pod(&self, ev: WatchEvent<k8s::Pod>) {
        let WatchEvent { event_type, object: pod } = ev;
        let Some(node) = pod.spec.as_ref().and_then(|s| s.node_name.clone()) else {
            return;
        };
        if !self.locations.is_edge_node(&node) {
            trace!(%node, pod = %pod.name_any(), "Skipping pod on non-edge node");
            return;
        }

        let op = match event_type {
            EventType::Added => {
                self.locations.add_or_update_pod(&pod);
                Operation::Insert
            }
            EventType::Modified => {
                self.locations.add_or_update_pod(&pod);
                Operation::Update
            }
            EventType::Deleted => {
                // The cache holds only live pods, so configmap and secret fan-out reaches just
                // the nodes still running a pod that references them.
                self.locations
                    .delete_pod(&pod.namespace().unwrap_or_default(), &pod.name_any());
                Operation::Delete
            }
        };

        let ns = pod.namespace().unwrap_or_default();
        let res = match resource::build_resource(&node, &ns, resource::POD, &pod.name_any()) {
            Ok(res) => res,
            Err(error) => {
                warn!(%error, "Failed to build message resource");
                return;
            }
        };
        self.send(res, op, pod.resource_version(), &pod).await;
    }

    pub async fn handle_configmap(&self, ev: WatchEvent<k8s::ConfigMap>) {
        let WatchEvent { event_type, object } = ev;
        let ns = object.namespace().unwrap_or_default();
        let name = object.name_any();
        let nodes = self.locations.configmap_nodes(&ns, &name);
        if event_type == EventType::Deleted {
            self.locations.delete_configmap(&ns, &name);
        }
        self.fan_out(resource::CONFIGMAP, nodes, to_operation(event_type), &object)
            .await;
    }

    /// Added secrets are sent as updates; edges cannot tell a new secret from a changed one.
    pub async fn handle_secret(&self, ev: WatchEvent<k8s::Secret>) {
        let WatchEvent { event_type, object } = ev;
        let ns = object.namespace().unwrap_or_default();
        let name = object.name_any();
        let nodes = self.locations.secret_nodes(&ns, &name);
        let op = match event_type {
            EventType::Added | EventType::Modified => Operation::Update,
            EventType::Deleted => {
                self.locations.delete_secret(&ns, &name);
                Operation::Delete
            }
        };
        self.fan_out(resource::SECRET, nodes, op, &object).await;
    }

    pub async fn handle_node(&self, ev: WatchEvent<k8s::Node>) {
        let WatchEvent { event_type, object } = ev;
        let name = object.name_any();
        match event_type {
            EventType::Added | EventType::Modified => {
                if k8s::is_edge_node(&object, &self.role_label) {
                    self.locations.update_edge_node(name);
                } else if self.locations.is_edge_node(&name) {
                    debug!(node = %name, "Node is no longer an edge node");
                    self.locations.delete_node(&name);
                }
            }
            EventType::Deleted => {
                let was_edge = self.locations.is_edge_node(&name);
                self.locations.delete_node(&name);
                if !was_edge && !k8s::is_edge_node(&object, &self.role_label) {
                    return;
                }
                match resource::build_resource(&name, NODE_NAMESPACE, resource::NODE, &name) {
                    Ok(res) => self.send(res, Operation::Delete, None, &object).await,
                    Err(error) => warn!(%error, "Failed to build message resource"),
                }
            }
        }
    }

    pub async fn handle_rule(&self, ev: WatchEvent<Rule>) {
        self.send_router(resource::RULE, ev).await
    }

    pub async fn handle_rule_endpoint(&self, ev: WatchEvent<RuleEndpoint>) {
        self.send_router(resource::RULE_ENDPOINT, ev).await
    }

    /// Rules and rule endpoints are immutable on the router; updates are dropped.
    async fn send_router<K>(&self, resource_type: &str, ev: WatchEvent<K>)
    where
        K: ResourceExt + Serialize,
    {
        let WatchEvent { event_type, object } = ev;
        let op = match event_type {
            EventType::Added => Operation::Insert,
            EventType::Deleted => Operation::Delete,
            EventType::Modified => {
                warn!(
                    name = %object.name_any(),
                    "{resource_type} does not support updates",
                );
                return;
            }
        };
        match resource::build_resource_for_router(resource_type, &object.name_any()) {
            Ok(res) => self.send(res, op, object.resource_version(), &object).await,
            Err(error) => warn!(%error, "Failed to build message resource"),
        }
    }

    async fn fan_out<K>(&self, resource_type: &str, nodes: Vec<String>, op: Operation, obj: &K)
    where
        K: ResourceExt + Serialize,
    {
        debug!(
            nodes = nodes.len(),
            %op,
            name = %obj.name_any(),
            "Syncing {resource_type}",
        );
        let ns = obj.namespace();
        let ns = resource::namespace_or_null(ns.as_deref());
        for node in nodes {
            match resource::build_resource(&node, ns, resource_type, &obj.name_any()) {
                Ok(res) => self.send(res, op, obj.resource_version(), obj).await,
                Err(error) => warn!(%node, %error, "Failed to build message resource"),
            }
        }
    }

    async fn send<T: Serialize>(
        &self,
        res: String,
        op: Operation,
        resource_version: Option<String>,
        body: &T,
    ) {
        let msg = Message::new("")
            .build_router(modules::EDGE_CONTROLLER, modules::GROUP_RESOURCE, res, op)
            .with_resource_version(resource_version.unwrap_or_default())
            .fill_body(body);
        let resource = msg.resource().to_string();
        match self.messages.send(msg).await {
            Ok(()) => debug!(%op, %resource, "Sent message"),
            Err(error) => warn!(%op, %resource, %error, "Failed to send message"),
        }
    }
}

fn to_operation(event_type: EventType) -> Operation {
    match event_type {
        EventType::Added => Operation::Insert,
        EventType::Modified => Operation::Update,
        EventType::Deleted => Operation::Delete,
    }
}

fn spawn_loop<K, F>(
    name: &'static str,
    mut events: mpsc::Receiver<WatchEvent<K>>,
    drain: drain::Watch,
    dc: Arc<Downstream>,
    handle: F,
) -> JoinHandle<()>
where
    K: Send + 'static,
    F: Fn(Arc<Downstream>, WatchEvent<K>) -> BoxFuture<'static, ()> + Send + 'static,
{
    tokio::spawn(
        async move {
            let shutdown = drain.signaled();
            tokio::pin!(shutdown);
            loop {
                tokio::select! {
                    _ = &mut shutdown => {
                        info!("Stopping");
                        return;
                    }
                    ev = events.recv() => match ev {
                        Some(ev) => handle(dc.clone(), ev).await,
                        None => {
                            debug!("Event queue closed");
                            return;
                        }
                    },
                }
            }
        }
        .instrument(info_span!("downstream", kind = name)),
    )
}
