//! Composite label and field selectors attached to listeners.

use crate::{fields, labels};
use kube::{api::DynamicObject, ResourceExt};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};

/// Matches an object iff both its label and field selectors match.
///
/// Serialized as `"<labelSelector>;<fieldSelector>"`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector {
    pub label: labels::Selector,
    pub field: fields::Selector,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvalidSelector {
    #[error(transparent)]
    Label(#[from] labels::InvalidSelector),

    #[error(transparent)]
    Field(#[from] fields::InvalidSelector),
}

// === impl Selector ===

impl Selector {
    pub fn new(label: &str, field: &str) -> Result<Self, InvalidSelector> {
        Ok(Self {
            label: label.parse()?,
            field: field.parse()?,
        })
    }

    pub fn matches(&self, labels: &labels::Map, fields: &fields::Fields) -> bool {
        self.label.matches(labels) && self.field.matches(fields)
    }

    pub fn matches_object(&self, obj: &DynamicObject) -> bool {
        self.matches(obj.labels(), &object_fields(obj))
    }
}

impl FromStr for Selector {
    type Err = InvalidSelector;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (label, field) = s.split_once(';').unwrap_or((s, ""));
        Self::new(label, field)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{}", self.label, self.field)
    }
}

impl Serialize for Selector {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Selector {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        String::deserialize(d)?.parse().map_err(de::Error::custom)
    }
}

/// The field set an object exposes: name and namespace for every kind, plus `spec.nodeName` for
/// pods.
pub fn object_fields(obj: &DynamicObject) -> fields::Fields {
    let mut fields = fields::Fields::new();
    fields.insert("metadata.name".to_string(), obj.name_any());
    if let Some(ns) = obj.namespace() {
        fields.insert("metadata.namespace".to_string(), ns);
    }
    let kind = obj.types.as_ref().map(|t| t.kind.as_str());
    if kind == Some("Pod") {
        let node = obj
            .data
            .pointer("/spec/nodeName")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        fields.insert("spec.nodeName".to_string(), node.to_string());
    }
    fields
}
