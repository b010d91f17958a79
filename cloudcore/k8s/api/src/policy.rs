use k8s_openapi::api::{
    core::v1::ServiceAccount,
    rbac::v1::{ClusterRoleBinding, PolicyRule, RoleBinding},
};
use kube::CustomResource;
use serde::{Deserialize, Serialize};

/// Records, for one service account, the RBAC rules reachable through its bindings and the edge
/// nodes those rules are projected to.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize)]
#[kube(
    group = "policy.kubeedge.io",
    version = "v1alpha1",
    kind = "ServiceAccountAccess",
    namespaced,
    status = "AccessStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct AccessSpec {
    #[serde(default)]
    pub service_account: ServiceAccount,
    #[serde(default, rename = "serviceAccountUid", skip_serializing_if = "String::is_empty")]
    pub service_account_uid: String,
    #[serde(default, rename = "accessRoleBinding", skip_serializing_if = "Vec::is_empty")]
    pub access_role_bindings: Vec<AccessRoleBinding>,
    #[serde(
        default,
        rename = "accessClusterRoleBinding",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub access_cluster_role_bindings: Vec<AccessClusterRoleBinding>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessRoleBinding {
    pub role_binding: RoleBinding,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<PolicyRule>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessClusterRoleBinding {
    pub cluster_role_binding: ClusterRoleBinding,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<PolicyRule>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_list: Vec<String>,
}

impl ServiceAccountAccess {
    /// Nodes recorded on the status, if any.
    pub fn node_list(&self) -> &[String] {
        self.status
            .as_ref()
            .map(|s| s.node_list.as_slice())
            .unwrap_or_default()
    }
}
