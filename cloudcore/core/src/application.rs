//! The envelope an edge node uses to ask the cloud to perform a resource operation on its behalf.

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Reserved key segment standing in for the core (empty) API group.
pub const CORE_GROUP: &str = "core";

/// Reserved key segment standing in for an empty namespace or name.
pub const NULL_SEGMENT: &str = "null";

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Application {
    #[serde(rename = "ID", default)]
    pub id: String,
    pub key: String,
    pub verb: Verb,
    pub nodename: String,
    #[serde(default)]
    pub subresource: String,
    #[serde(default)]
    pub status: ApplicationStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StatusError>,
    #[serde(default, with = "base64_bytes")]
    pub option: Vec<u8>,
    #[serde(default, with = "base64_bytes")]
    pub req_body: Vec<u8>,
    #[serde(default, with = "base64_bytes")]
    pub resp_body: Vec<u8>,
    #[serde(default)]
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub count: u64,
}

/// A structural API status error, carried so the edge can reconstruct the typed error.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct StatusError {
    #[serde(rename = "ErrStatus")]
    pub status: metav1::Status,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum Verb {
    #[default]
    Get,
    List,
    Watch,
    Create,
    Delete,
    Update,
    UpdateStatus,
    Patch,
    Other(String),
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum ApplicationStatus {
    #[default]
    PreApplying,
    InApplying,
    InProcessing,
    Approved,
    Rejected,
    Failed,
    Completed,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Gvr {
    pub group: String,
    pub version: String,
    pub resource: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PatchInfo {
    pub name: String,
    pub patch_type: String,
    #[serde(default, with = "base64_bytes")]
    pub data: Vec<u8>,
    #[serde(default)]
    pub options: PatchOptions,
    #[serde(default)]
    pub subresources: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchOptions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dry_run: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_manager: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApplicationError {
    #[error("failed to decode Application: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to parse Option bytes, {0}")]
    Option(#[source] serde_json::Error),

    #[error("failed to parse ReqBody bytes, {0}")]
    ReqBody(#[source] serde_json::Error),

    #[error("application status may not move from {from:?} to {to:?}")]
    StatusRegression {
        from: ApplicationStatus,
        to: ApplicationStatus,
    },
}

// === impl Application ===

impl Application {
    pub fn new(
        nodename: impl Into<String>,
        key: impl Into<String>,
        verb: Verb,
        option: Vec<u8>,
        req_body: Vec<u8>,
    ) -> Self {
        let mut app = Self {
            key: key.into(),
            verb,
            nodename: nodename.into(),
            option,
            req_body,
            timestamp: Some(Utc::now()),
            ..Default::default()
        };
        app.id = app.compute_id();
        app
    }

    pub fn with_subresource(mut self, subresource: impl Into<String>) -> Self {
        self.subresource = subresource.into();
        self.id = self.compute_id();
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self.id = self.compute_id();
        self
    }

    /// Hex-encoded SHA-256 over every field that defines the request.
    pub fn compute_id(&self) -> String {
        let mut h = Sha256::new();
        h.update(self.nodename.as_bytes());
        h.update(self.key.as_bytes());
        h.update(self.verb.as_str().as_bytes());
        h.update(&self.option);
        h.update(&self.req_body);
        h.update(self.subresource.as_bytes());
        h.update(self.token.as_bytes());
        hex::encode(h.finalize())
    }

    /// Returns the application's identifier, computing it if the sender left it empty.
    pub fn identifier(&mut self) -> &str {
        if self.id.is_empty() {
            self.id = self.compute_id();
        }
        &self.id
    }

    /// Decodes an application from raw message content.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ApplicationError> {
        serde_json::from_slice(bytes).map_err(ApplicationError::Decode)
    }

    /// Starts a processing pass. A resent application may already carry a verdict from an earlier
    /// pass; that verdict and its response are discarded.
    pub fn begin_processing(&mut self) {
        self.status = ApplicationStatus::InProcessing;
        self.reason.clear();
        self.error = None;
        self.resp_body.clear();
    }

    /// Moves the application forward. Earlier statuses, and switching between final verdicts, are
    /// refused.
    pub fn set_status(&mut self, to: ApplicationStatus) -> Result<(), ApplicationError> {
        let from = self.status;
        if to.rank() < from.rank() || (to.rank() == from.rank() && to != from) {
            return Err(ApplicationError::StatusRegression { from, to });
        }
        self.status = to;
        Ok(())
    }

    /// Decodes `Option`; an empty option decodes from `{}`.
    pub fn option_to<T: DeserializeOwned>(&self) -> Result<T, ApplicationError> {
        let bytes: &[u8] = if self.option.is_empty() {
            b"{}"
        } else {
            &self.option
        };
        serde_json::from_slice(bytes).map_err(ApplicationError::Option)
    }

    pub fn req_body_to<T: DeserializeOwned>(&self) -> Result<T, ApplicationError> {
        serde_json::from_slice(&self.req_body).map_err(ApplicationError::ReqBody)
    }

    pub fn gvr(&self) -> Gvr {
        parse_key(&self.key).0
    }

    pub fn namespace(&self) -> String {
        parse_key(&self.key).1
    }
}

impl fmt::Display for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(NodeName={};Key={};Verb={};Status={:?};Reason={})",
            self.nodename, self.key, self.verb, self.status, self.reason
        )
    }
}

/// Splits `/<group>/<version>/<resource>/<namespace>/<name>` into its parts. Missing trailing
/// segments and the reserved sentinels map to empty strings.
pub fn parse_key(key: &str) -> (Gvr, String, String) {
    let mut parts = key.trim_start_matches('/').split('/').map(|s| match s {
        NULL_SEGMENT => "",
        s => s,
    });
    let mut next = || parts.next().unwrap_or_default().to_string();
    let group = match next() {
        g if g == CORE_GROUP => String::new(),
        g => g,
    };
    let version = next();
    let resource = next();
    let namespace = next();
    let name = next();
    (
        Gvr {
            group,
            version,
            resource,
        },
        namespace,
        name,
    )
}

/// The inverse of [`parse_key`].
pub fn build_key(gvr: &Gvr, namespace: &str, name: &str) -> String {
    let or_null = |s: &str| {
        if s.is_empty() {
            NULL_SEGMENT.to_string()
        } else {
            s.to_string()
        }
    };
    let group = if gvr.group.is_empty() {
        CORE_GROUP.to_string()
    } else {
        gvr.group.clone()
    };
    format!(
        "/{}/{}/{}/{}/{}",
        group,
        gvr.version,
        gvr.resource,
        or_null(namespace),
        or_null(name)
    )
}

// === impl Verb ===

impl Verb {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "get",
            Self::List => "list",
            Self::Watch => "watch",
            Self::Create => "create",
            Self::Delete => "delete",
            Self::Update => "update",
            Self::UpdateStatus => "updatestatus",
            Self::Patch => "patch",
            Self::Other(v) => v,
        }
    }
}

impl From<String> for Verb {
    fn from(s: String) -> Self {
        match s.as_str() {
            "get" => Self::Get,
            "list" => Self::List,
            "watch" => Self::Watch,
            "create" => Self::Create,
            "delete" => Self::Delete,
            "update" => Self::Update,
            "updatestatus" => Self::UpdateStatus,
            "patch" => Self::Patch,
            _ => Self::Other(s),
        }
    }
}

impl From<Verb> for String {
    fn from(v: Verb) -> Self {
        v.as_str().to_string()
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl ApplicationStatus ===

impl ApplicationStatus {
    fn rank(self) -> u8 {
        match self {
            Self::PreApplying => 0,
            Self::InApplying => 1,
            Self::InProcessing => 2,
            Self::Approved | Self::Rejected | Self::Failed => 3,
            Self::Completed => 4,
        }
    }
}

// === impl Gvr ===

impl Gvr {
    pub fn new(group: &str, version: &str, resource: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            resource: resource.to_string(),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for Gvr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Resource={}", self.api_version(), self.resource)
    }
}

/// Byte payloads encode as base64 strings; `null` decodes as empty.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        if bytes.is_empty() {
            return s.serialize_none();
        }
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(d)? {
            Some(s) => STANDARD.decode(s).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_app() -> Application {
        Application::new(
            "edge-1",
            "/core/v1/pods/default/p",
            Verb::Get,
            br#"{"resourceVersion":"0"}"#.to_vec(),
            Vec::new(),
        )
    }

    #[test]
    fn identical_requests_share_an_id() {
        let a = mk_app();
        let b = mk_app();
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.len(), 64);
    }

    #[test]
    fn any_field_changes_the_id() {
        let base = mk_app();
        let variants = [
            Application::new("edge-2", base.key.clone(), Verb::Get, base.option.clone(), vec![]),
            Application::new("edge-1", "/core/v1/pods/default/q", Verb::Get, base.option.clone(), vec![]),
            Application::new("edge-1", base.key.clone(), Verb::List, base.option.clone(), vec![]),
            Application::new("edge-1", base.key.clone(), Verb::Get, b"{}".to_vec(), vec![]),
            Application::new("edge-1", base.key.clone(), Verb::Get, base.option.clone(), b"{}".to_vec()),
            mk_app().with_subresource("status"),
            mk_app().with_token("t0k3n"),
        ];
        for v in variants {
            assert_ne!(v.id, base.id, "{v}");
        }
    }

    #[test]
    fn identifier_fills_missing_id() {
        let mut app = mk_app();
        let expected = app.id.clone();
        app.id.clear();
        assert_eq!(app.identifier(), expected);
    }

    #[test]
    fn parses_keys() {
        let (gvr, ns, name) = parse_key("/core/v1/pods/default/p");
        assert_eq!(gvr, Gvr::new("", "v1", "pods"));
        assert_eq!(ns, "default");
        assert_eq!(name, "p");

        let (gvr, ns, name) = parse_key("/apps/v1/deployments/null/null");
        assert_eq!(gvr, Gvr::new("apps", "v1", "deployments"));
        assert!(ns.is_empty());
        assert!(name.is_empty());

        let (gvr, ns, name) = parse_key("/core/v1/nodes");
        assert_eq!(gvr.resource, "nodes");
        assert!(ns.is_empty() && name.is_empty());

        let gvr = Gvr::new("discovery.k8s.io", "v1", "endpointslices");
        let key = build_key(&gvr, "", "kubernetes");
        assert_eq!(key, "/discovery.k8s.io/v1/endpointslices/null/kubernetes");
        assert_eq!(parse_key(&key), (gvr, String::new(), "kubernetes".to_string()));
    }

    #[test]
    fn status_is_monotonic() {
        let mut app = mk_app();
        app.set_status(ApplicationStatus::InProcessing).unwrap();
        app.set_status(ApplicationStatus::Approved).unwrap();
        assert!(app.set_status(ApplicationStatus::InApplying).is_err());
        assert!(app.set_status(ApplicationStatus::Rejected).is_err());
        app.set_status(ApplicationStatus::Completed).unwrap();
        assert_eq!(app.status, ApplicationStatus::Completed);
    }

    #[test]
    fn resent_applications_are_processed_again() {
        let mut app = mk_app();
        app.set_status(ApplicationStatus::Rejected).unwrap();
        app.reason = "denied".to_string();
        app.resp_body = b"old".to_vec();

        app.begin_processing();
        assert_eq!(app.status, ApplicationStatus::InProcessing);
        assert_eq!(app.reason, "");
        assert!(app.resp_body.is_empty());
        app.set_status(ApplicationStatus::Approved).unwrap();
    }

    #[test]
    fn wire_compatible_json() {
        let mut app = mk_app();
        app.resp_body = b"hello".to_vec();
        app.verb = Verb::UpdateStatus;
        let json = serde_json::to_value(&app).unwrap();
        assert_eq!(json["Verb"], "updatestatus");
        assert_eq!(json["Nodename"], "edge-1");
        assert_eq!(json["RespBody"], "aGVsbG8=");
        assert_eq!(json["ReqBody"], serde_json::Value::Null);
        assert_eq!(json["Status"], "PreApplying");

        let decoded = Application::from_bytes(&serde_json::to_vec(&json).unwrap()).unwrap();
        assert_eq!(decoded.resp_body, b"hello");
        assert_eq!(decoded.verb, Verb::UpdateStatus);

        let odd: Application = serde_json::from_value(serde_json::json!({
            "Key": "/core/v1/pods/default/p",
            "Verb": "proxy",
            "Nodename": "edge-1",
        }))
        .unwrap();
        assert_eq!(odd.verb, Verb::Other("proxy".to_string()));
    }

    #[test]
    fn empty_option_decodes_as_default() {
        #[derive(Deserialize, Default)]
        struct Opts {
            #[serde(rename = "labelSelector", default)]
            label_selector: String,
        }
        let app = Application::new("n", "/core/v1/pods/null/null", Verb::List, vec![], vec![]);
        let opts: Opts = app.option_to().unwrap();
        assert!(opts.label_selector.is_empty());
    }
}
