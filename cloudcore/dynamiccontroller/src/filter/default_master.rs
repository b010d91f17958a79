use super::{kind_of, Filter};
use cloudcore_k8s_api::{DynamicObject, ResourceExt};
use serde_json::{json, Value};

const LOCAL_ADDRESS: &str = "127.0.0.1";

/// Points the cluster's default `kubernetes` endpoints at the node-local meta server.
#[derive(Clone, Debug)]
pub struct DefaultMaster {
    meta_server_port: u16,
}

// === impl DefaultMaster ===

impl DefaultMaster {
    pub fn new(meta_server_port: u16) -> Self {
        Self { meta_server_port }
    }
}

impl Filter for DefaultMaster {
    fn name(&self) -> &'static str {
        "default-master"
    }

    fn need_filter(&self, obj: &DynamicObject) -> bool {
        kind_of(obj) == Some("EndpointSlice")
            && obj.namespace().as_deref() == Some("default")
            && obj.name_any() == "kubernetes"
    }

    fn filter_resource(&self, _target_node: &str, obj: &mut DynamicObject) {
        if let Some(Value::Array(endpoints)) = obj.data.get_mut("endpoints") {
            endpoints.truncate(1);
            if let Some(endpoint) = endpoints.first_mut() {
                endpoint["addresses"] = json!([LOCAL_ADDRESS]);
            }
        }
        if let Some(Value::Array(ports)) = obj.data.get_mut("ports") {
            for port in ports {
                if port.get("name").and_then(Value::as_str) == Some("https") {
                    port["port"] = json!(self.meta_server_port);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudcore_k8s_api::ObjectMeta;
    use kube::core::TypeMeta;

    fn mk_slice(ns: &str, name: &str) -> DynamicObject {
        DynamicObject {
            types: Some(TypeMeta {
                api_version: "discovery.k8s.io/v1".to_string(),
                kind: "EndpointSlice".to_string(),
            }),
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            data: json!({
                "addressType": "IPv4",
                "endpoints": [
                    { "addresses": ["172.18.0.2"], "conditions": { "ready": true } },
                    { "addresses": ["172.18.0.3"], "conditions": { "ready": true } },
                ],
                "ports": [
                    { "name": "https", "port": 6443, "protocol": "TCP" },
                    { "name": "metrics", "port": 9090, "protocol": "TCP" },
                ],
            }),
        }
    }

    #[test]
    fn rewrites_the_default_kubernetes_endpoints() {
        let filter = DefaultMaster::new(10550);
        let mut slice = mk_slice("default", "kubernetes");
        assert!(filter.need_filter(&slice));
        filter.filter_resource("edge-1", &mut slice);

        assert_eq!(
            slice.data["endpoints"],
            json!([{ "addresses": ["127.0.0.1"], "conditions": { "ready": true } }])
        );
        assert_eq!(slice.data["ports"][0]["port"], 10550);
        assert_eq!(slice.data["ports"][1]["port"], 9090);
    }

    #[test]
    fn ignores_other_slices() {
        let filter = DefaultMaster::new(10550);
        assert!(!filter.need_filter(&mk_slice("kube-system", "kubernetes")));
        assert!(!filter.need_filter(&mk_slice("default", "web")));
    }
}
