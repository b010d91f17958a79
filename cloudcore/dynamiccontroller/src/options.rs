use kube::api::ListParams;
use serde::{Deserialize, Serialize};

/// List and watch options as edge nodes encode them in an application's `Option`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ListOptions {
    pub label_selector: String,
    pub field_selector: String,
    pub resource_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(rename = "continue", skip_serializing_if = "Option::is_none")]
    pub continue_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u32>,
}

impl ListOptions {
    pub fn to_params(&self) -> ListParams {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        ListParams {
            label_selector: non_empty(&self.label_selector),
            field_selector: non_empty(&self.field_selector),
            timeout: self.timeout_seconds,
            limit: self.limit,
            continue_token: self.continue_token.clone(),
            ..Default::default()
        }
    }

    /// The version a watch resumes from; empty and `"0"` mean "from the current state".
    pub fn resume_version(&self) -> Option<u64> {
        match self.resource_version.as_str() {
            "" | "0" => None,
            rv => rv.parse().ok(),
        }
    }
}
