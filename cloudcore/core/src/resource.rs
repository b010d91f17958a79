//! The resource-path grammar used as a message routing key.
//!
//! ```text
//! node/<nodeID>/<namespace>/<resourceType>[/<resourceName>]
//! node/<nodeID>/<resourceType>[/<resourceID>]          ; device form
//! <resourceType>/<resourceID>                          ; router form
//! ```

pub const SEP: &str = "/";
pub const NODE: &str = "node";

/// Stands in for an empty namespace in a resource path.
pub const NULL_NAMESPACE: &str = "null";

pub const POD: &str = "pod";
pub const POD_STATUS: &str = "podstatus";
pub const POD_PATCH: &str = "podpatch";
pub const CONFIGMAP: &str = "configmap";
pub const SECRET: &str = "secret";
pub const NODE_STATUS: &str = "nodestatus";
pub const NODE_PATCH: &str = "nodepatch";
pub const LEASE: &str = "lease";
pub const CSR: &str = "certificatesigningrequest";
pub const SERVICE_ACCOUNT_TOKEN: &str = "serviceaccounttoken";
pub const PERSISTENT_VOLUME: &str = "persistentvolume";
pub const PERSISTENT_VOLUME_CLAIM: &str = "persistentvolumeclaim";
pub const VOLUME_ATTACHMENT: &str = "volumeattachment";
pub const RULE: &str = "rule";
pub const RULE_ENDPOINT: &str = "ruleendpoint";
pub const RULE_STATUS: &str = "rulestatus";
pub const SERVICE_ACCOUNT_ACCESS: &str = "serviceaccountaccess";

pub const DEVICE: &str = "device";
pub const TWIN_EDGE_UPDATED: &str = "twin/edge_updated";
pub const MEMBERSHIP_DETAIL: &str = "membership/detail";
pub const DEVICE_STATE_UPDATED: &str = "device/updated";

const NODE_ID_IDX: usize = 1;
const NAMESPACE_IDX: usize = 2;
const RESOURCE_TYPE_IDX: usize = 3;
const RESOURCE_NAME_IDX: usize = 4;
const DEVICE_ID_IDX: usize = 3;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    #[error("required parameter are not set (node id, namespace or resource type)")]
    MissingNodeParameter,

    #[error("required parameter are not set (resourceID or resource type)")]
    MissingRouterParameter,

    #[error("node id not found")]
    NodeIdNotFound,

    #[error("namespace not found")]
    NamespaceNotFound,

    #[error("resource type not found")]
    ResourceTypeNotFound,

    #[error("resource name not found")]
    ResourceNameNotFound,

    #[error("failed to get device id")]
    DeviceIdNotFound,

    #[error("unknown resource, found: {0}")]
    UnknownResource(String),
}

/// Builds `node/<nodeID>/<namespace>/<resourceType>[/<resourceName>]`.
pub fn build_resource(
    node_id: &str,
    namespace: &str,
    resource_type: &str,
    resource_name: &str,
) -> Result<String, ResourceError> {
    if node_id.is_empty() || namespace.is_empty() || resource_type.is_empty() {
        return Err(ResourceError::MissingNodeParameter);
    }
    let mut resource = [NODE, node_id, namespace, resource_type].join(SEP);
    if !resource_name.is_empty() {
        resource.push_str(SEP);
        resource.push_str(resource_name);
    }
    Ok(resource)
}

/// Builds `<resourceType>/<resourceID>` for router-domain resources.
pub fn build_resource_for_router(
    resource_type: &str,
    resource_id: &str,
) -> Result<String, ResourceError> {
    if resource_type.is_empty() || resource_id.is_empty() {
        return Err(ResourceError::MissingRouterParameter);
    }
    Ok(format!("{resource_type}{SEP}{resource_id}"))
}

/// Builds `node/<nodeID>/<resourceType>[/<resourceID>]`.
pub fn build_resource_for_device(
    node_id: &str,
    resource_type: &str,
    resource_id: &str,
) -> Result<String, ResourceError> {
    if node_id.is_empty() || resource_type.is_empty() {
        return Err(ResourceError::MissingNodeParameter);
    }
    let mut resource = [NODE, node_id, resource_type].join(SEP);
    if !resource_id.is_empty() {
        resource.push_str(SEP);
        resource.push_str(resource_id);
    }
    Ok(resource)
}

fn segment(resource: &str, idx: usize) -> Option<&str> {
    resource.split(SEP).nth(idx).filter(|s| !s.is_empty())
}

pub fn node_id(resource: &str) -> Result<&str, ResourceError> {
    segment(resource, NODE_ID_IDX).ok_or(ResourceError::NodeIdNotFound)
}

pub fn namespace(resource: &str) -> Result<&str, ResourceError> {
    segment(resource, NAMESPACE_IDX).ok_or(ResourceError::NamespaceNotFound)
}

pub fn resource_type(resource: &str) -> Result<&str, ResourceError> {
    segment(resource, RESOURCE_TYPE_IDX).ok_or(ResourceError::ResourceTypeNotFound)
}

pub fn resource_name(resource: &str) -> Result<&str, ResourceError> {
    segment(resource, RESOURCE_NAME_IDX).ok_or(ResourceError::ResourceNameNotFound)
}

pub fn device_id(resource: &str) -> Result<&str, ResourceError> {
    segment(resource, DEVICE_ID_IDX).ok_or(ResourceError::DeviceIdNotFound)
}

/// Classifies a device-form resource by the twin/membership/state marker it contains.
pub fn resource_type_for_device(resource: &str) -> Result<&'static str, ResourceError> {
    [TWIN_EDGE_UPDATED, MEMBERSHIP_DETAIL, DEVICE_STATE_UPDATED]
        .into_iter()
        .find(|marker| resource.contains(marker))
        .ok_or_else(|| ResourceError::UnknownResource(resource.to_string()))
}

/// Replaces an empty namespace with the null-namespace token.
pub fn namespace_or_null(ns: Option<&str>) -> &str {
    match ns {
        Some(ns) if !ns.is_empty() => ns,
        _ => NULL_NAMESPACE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_parse() {
        for (node, ns, ty, name) in [
            ("edge-1", "default", POD, "p1"),
            ("NodeA", "kube-system", CONFIGMAP, "cm.v2"),
            ("n", NULL_NAMESPACE, "endpointslice", "kubernetes-xyz"),
        ] {
            let res = build_resource(node, ns, ty, name).unwrap();
            assert_eq!(node_id(&res).unwrap(), node);
            assert_eq!(namespace(&res).unwrap(), ns);
            assert_eq!(resource_type(&res).unwrap(), ty);
            assert_eq!(resource_name(&res).unwrap(), name);
        }
    }

    #[test]
    fn build_requires_node_namespace_and_type() {
        assert_eq!(
            build_resource("", "default", POD, "p").unwrap_err().to_string(),
            "required parameter are not set (node id, namespace or resource type)"
        );
        assert_eq!(
            build_resource("n", "", POD, "p"),
            Err(ResourceError::MissingNodeParameter)
        );
        assert_eq!(
            build_resource("n", "default", "", "p"),
            Err(ResourceError::MissingNodeParameter)
        );
        assert_eq!(
            build_resource("n", "default", POD, "").unwrap(),
            "node/n/default/pod"
        );
    }

    #[test]
    fn router_form() {
        assert_eq!(build_resource_for_router(RULE, "r1").unwrap(), "rule/r1");
        assert_eq!(
            build_resource_for_router("", "r1").unwrap_err().to_string(),
            "required parameter are not set (resourceID or resource type)"
        );
        assert_eq!(
            build_resource_for_router(RULE, ""),
            Err(ResourceError::MissingRouterParameter)
        );
    }

    #[test]
    fn missing_segments() {
        assert_eq!(node_id(""), Err(ResourceError::NodeIdNotFound));
        assert_eq!(namespace("node/n"), Err(ResourceError::NamespaceNotFound));
        assert_eq!(
            resource_type("node/n/default"),
            Err(ResourceError::ResourceTypeNotFound)
        );
        assert_eq!(
            resource_name("node/n/default/pod").unwrap_err().to_string(),
            "resource name not found"
        );
    }

    #[test]
    fn device_form() {
        let res = build_resource_for_device("nid", DEVICE, "did").unwrap();
        assert_eq!(res, "node/nid/device/did");
        assert_eq!(device_id(&res).unwrap(), "did");
        assert_eq!(
            device_id("node/nid/device").unwrap_err().to_string(),
            "failed to get device id"
        );
        assert_eq!(
            build_resource_for_device("", "", ""),
            Err(ResourceError::MissingNodeParameter)
        );

        assert_eq!(
            resource_type_for_device("node/nid/twin/edge_updated").unwrap(),
            TWIN_EDGE_UPDATED
        );
        assert_eq!(
            resource_type_for_device(MEMBERSHIP_DETAIL).unwrap(),
            MEMBERSHIP_DETAIL
        );
        assert_eq!(
            resource_type_for_device("").unwrap_err().to_string(),
            "unknown resource, found: "
        );
    }

    #[test]
    fn null_namespace() {
        assert_eq!(namespace_or_null(None), NULL_NAMESPACE);
        assert_eq!(namespace_or_null(Some("")), NULL_NAMESPACE);
        assert_eq!(namespace_or_null(Some("default")), "default");
    }
}
