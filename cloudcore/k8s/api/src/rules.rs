use kube::CustomResource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Routes messages from a source endpoint to a target endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize)]
#[kube(
    group = "rules.kubeedge.io",
    version = "v1",
    kind = "Rule",
    namespaced,
    status = "RuleStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct RuleSpec {
    pub source: String,
    #[serde(default)]
    pub source_resource: BTreeMap<String, String>,
    pub target: String,
    #[serde(default)]
    pub target_resource: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleStatus {
    #[serde(default)]
    pub success_messages: i64,
    #[serde(default)]
    pub fail_messages: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// An endpoint a rule may name as its source or target.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize)]
#[kube(
    group = "rules.kubeedge.io",
    version = "v1",
    kind = "RuleEndpoint",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct RuleEndpointSpec {
    pub rule_endpoint_type: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}
