use super::{kind_of, Filter};
use cloudcore_k8s_api::{DynamicObject, Node, ResourceExt, Service};
use cloudcore_k8s_index::Lister;
use serde_json::Value;

/// Annotation selecting how a service's endpoints are scoped.
pub const SERVICE_TOPOLOGY_ANNOTATION: &str = "apps.kubeedge.io/service-topology";

/// Topology value restricting endpoints to the target node's node group.
pub const RANGE_NODE_GROUP: &str = "range-nodegroup";

/// Label naming the node group a node belongs to.
pub const NODE_GROUP_LABEL: &str = "apps.kubeedge.io/belonging-to";

const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// Drops the endpoints of node-group-scoped services that live outside the target node's group.
#[derive(Clone)]
pub struct EndpointResource {
    services: Lister<Service>,
    nodes: Lister<Node>,
}

// === impl EndpointResource ===

impl EndpointResource {
    pub fn new(services: Lister<Service>, nodes: Lister<Node>) -> Self {
        Self { services, nodes }
    }

    fn service_name(obj: &DynamicObject) -> Option<String> {
        match kind_of(obj)? {
            "EndpointSlice" => obj.labels().get(SERVICE_NAME_LABEL).cloned(),
            "Endpoints" => Some(obj.name_any()),
            _ => None,
        }
    }

    fn node_group(&self, node: &str) -> Option<String> {
        self.nodes.get("", node)?.labels().get(NODE_GROUP_LABEL).cloned()
    }

    /// Returns a predicate over endpoint node names that holds for nodes in `group`.
    fn in_group<'a>(&'a self, group: &'a str) -> impl Fn(&Value) -> bool + 'a {
        move |endpoint: &Value| {
            endpoint
                .get("nodeName")
                .and_then(Value::as_str)
                .and_then(|node| self.node_group(node))
                .map(|g| g == group)
                .unwrap_or(false)
        }
    }
}

impl Filter for EndpointResource {
    fn name(&self) -> &'static str {
        "endpoint-resource"
    }

    fn need_filter(&self, obj: &DynamicObject) -> bool {
        let Some(service) = Self::service_name(obj) else {
            return false;
        };
        let ns = obj.namespace().unwrap_or_default();
        self.services
            .get(&ns, &service)
            .and_then(|svc| svc.annotations().get(SERVICE_TOPOLOGY_ANNOTATION).cloned())
            .map(|topology| topology == RANGE_NODE_GROUP)
            .unwrap_or(false)
    }

    fn filter_resource(&self, target_node: &str, obj: &mut DynamicObject) {
        // A node outside every group sees none of a group-scoped service's endpoints.
        let group = self.node_group(target_node).unwrap_or_default();
        let keep = self.in_group(&group);
        let retain = |list: Option<&mut Value>| {
            if let Some(Value::Array(items)) = list {
                items.retain(|e| !group.is_empty() && keep(e));
            }
        };

        let kind = kind_of(obj).map(str::to_string);
        match kind.as_deref() {
            Some("EndpointSlice") => retain(obj.data.get_mut("endpoints")),
            Some("Endpoints") => {
                if let Some(Value::Array(subsets)) = obj.data.get_mut("subsets") {
                    for subset in subsets {
                        retain(subset.get_mut("addresses"));
                        retain(subset.get_mut("notReadyAddresses"));
                    }
                }
            }
            _ => {}
        }
    }
}
