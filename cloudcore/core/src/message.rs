use crate::resource::{self, ResourceError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The envelope exchanged between cloud modules and edge nodes.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Message {
    pub header: MessageHeader,
    #[serde(rename = "route")]
    pub router: MessageRoute,
    #[serde(default)]
    pub content: serde_json::Value,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct MessageHeader {
    #[serde(rename = "msg_id")]
    pub id: String,
    #[serde(rename = "parent_msg_id", default, skip_serializing_if = "String::is_empty")]
    pub parent_id: String,
    /// Milliseconds since the unix epoch.
    pub timestamp: i64,
    #[serde(rename = "resourceversion", default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,
    #[serde(default)]
    pub sync: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct MessageRoute {
    pub source: String,
    pub group: String,
    pub operation: Operation,
    pub resource: String,
}

/// The closed set of operations a message may carry.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    #[default]
    Insert,
    Update,
    Delete,
    Query,
    Patch,
    Response,
}

// === impl Message ===

impl Message {
    /// Creates a message with a fresh ID. `parent_id` is empty unless the message answers another.
    pub fn new(parent_id: impl Into<String>) -> Self {
        Self {
            header: MessageHeader {
                id: uuid::Uuid::new_v4().to_string(),
                parent_id: parent_id.into(),
                timestamp: chrono::Utc::now().timestamp_millis(),
                resource_version: String::new(),
                sync: false,
            },
            router: MessageRoute::default(),
            content: serde_json::Value::Null,
        }
    }

    /// Creates a `response` message whose parent is `request`, preserving the request's resource.
    pub fn response_to(request: &Message, source: &str) -> Self {
        Self::new(request.id()).build_router(
            source,
            &request.router.group,
            request.router.resource.clone(),
            Operation::Response,
        )
    }

    pub fn build_router(
        mut self,
        source: &str,
        group: &str,
        resource: impl Into<String>,
        operation: Operation,
    ) -> Self {
        self.router = MessageRoute {
            source: source.to_string(),
            group: group.to_string(),
            operation,
            resource: resource.into(),
        };
        self
    }

    pub fn with_resource_version(mut self, rv: impl Into<String>) -> Self {
        self.header.resource_version = rv.into();
        self
    }

    pub fn with_sync(mut self, sync: bool) -> Self {
        self.header.sync = sync;
        self
    }

    /// Serializes `body` into the message content. Serialization failures leave a null body.
    pub fn fill_body<T: Serialize>(mut self, body: &T) -> Self {
        self.content = match serde_json::to_value(body) {
            Ok(v) => v,
            Err(error) => {
                tracing::warn!(id = %self.header.id, %error, "Failed to encode message content");
                serde_json::Value::Null
            }
        };
        self
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.header.id
    }

    #[inline]
    pub fn parent_id(&self) -> &str {
        &self.header.parent_id
    }

    #[inline]
    pub fn operation(&self) -> Operation {
        self.router.operation
    }

    #[inline]
    pub fn resource(&self) -> &str {
        &self.router.resource
    }

    /// Returns the raw content bytes: strings are returned verbatim, anything else is JSON-encoded.
    pub fn content_data(&self) -> serde_json::Result<Vec<u8>> {
        match &self.content {
            serde_json::Value::String(s) => Ok(s.as_bytes().to_vec()),
            v => serde_json::to_vec(v),
        }
    }

    /// Decodes the message content into `T`, accepting either a JSON value or a JSON document
    /// that was carried as a string.
    pub fn content_to<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        match &self.content {
            serde_json::Value::String(s) => serde_json::from_str(s),
            v => T::deserialize(v),
        }
    }

    pub fn node_id(&self) -> Result<&str, ResourceError> {
        resource::node_id(self.resource())
    }

    pub fn namespace(&self) -> Result<&str, ResourceError> {
        resource::namespace(self.resource())
    }

    pub fn resource_type(&self) -> Result<&str, ResourceError> {
        resource::resource_type(self.resource())
    }

    pub fn resource_name(&self) -> Result<&str, ResourceError> {
        resource::resource_name(self.resource())
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Query => "query",
            Self::Patch => "patch",
            Self::Response => "response",
        };
        f.write_str(s)
    }
}
