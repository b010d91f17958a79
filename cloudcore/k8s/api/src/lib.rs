#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod fields;
pub mod labels;
pub mod policy;
pub mod rules;
pub mod selector;
pub mod time;
mod watch;

pub use self::{
    selector::Selector,
    watch::{Error as WatchError, Event, Watch},
};
pub use k8s_openapi::{
    api::{
        self,
        certificates::v1::CertificateSigningRequest,
        coordination::v1::Lease,
        core::v1::{
            ConfigMap, Endpoints, Node, NodeSpec, NodeStatus, PersistentVolume,
            PersistentVolumeClaim, Pod, PodSpec, PodStatus, Secret, Service, ServiceAccount,
        },
        discovery::v1::EndpointSlice,
        rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding},
        storage::v1::VolumeAttachment,
    },
    apimachinery::pkg::apis::meta::v1::{Status, Time},
};
pub use kube::{
    api::{ApiResource, DynamicObject, ObjectMeta, ResourceExt},
    core::GroupVersionKind,
    Resource,
};

/// Label marking a node as an edge node.
pub const EDGE_NODE_ROLE_LABEL: &str = "node-role.kubernetes.io/edge";

/// Returns true if `node` carries `role_label`.
pub fn is_edge_node(node: &Node, role_label: &str) -> bool {
    node.labels().contains_key(role_label)
}

/// Names of the configmaps and secrets a pod references through volumes, projected volumes and
/// `envFrom`/`valueFrom` sources.
pub fn pod_references(pod: &Pod) -> (Vec<String>, Vec<String>) {
    let mut configmaps = Vec::new();
    let mut secrets = Vec::new();
    let Some(spec) = pod.spec.as_ref() else {
        return (configmaps, secrets);
    };

    for vol in spec.volumes.iter().flatten() {
        if let Some(cm) = vol.config_map.as_ref() {
            configmaps.push(cm.name.clone());
        }
        if let Some(name) = vol.secret.as_ref().and_then(|s| s.secret_name.clone()) {
            secrets.push(name);
        }
        for src in vol
            .projected
            .iter()
            .flat_map(|p| p.sources.iter().flatten())
        {
            if let Some(cm) = src.config_map.as_ref() {
                configmaps.push(cm.name.clone());
            }
            if let Some(s) = src.secret.as_ref() {
                secrets.push(s.name.clone());
            }
        }
    }

    let containers = spec
        .containers
        .iter()
        .chain(spec.init_containers.iter().flatten());
    for c in containers {
        for env_from in c.env_from.iter().flatten() {
            if let Some(cm) = env_from.config_map_ref.as_ref() {
                configmaps.push(cm.name.clone());
            }
            if let Some(s) = env_from.secret_ref.as_ref() {
                secrets.push(s.name.clone());
            }
        }
        for env in c.env.iter().flatten() {
            let Some(from) = env.value_from.as_ref() else {
                continue;
            };
            if let Some(cm) = from.config_map_key_ref.as_ref() {
                configmaps.push(cm.name.clone());
            }
            if let Some(s) = from.secret_key_ref.as_ref() {
                secrets.push(s.name.clone());
            }
        }
    }

    for s in spec.image_pull_secrets.iter().flatten() {
        secrets.push(s.name.clone());
    }

    configmaps.retain(|n| !n.is_empty());
    secrets.retain(|n| !n.is_empty());
    configmaps.sort();
    configmaps.dedup();
    secrets.sort();
    secrets.dedup();
    (configmaps, secrets)
}
