use super::{decode, Reply, Upstream, UpstreamError};
use cloudcore_core::{Message, Operation};
use cloudcore_k8s_api::{self as k8s, time};
use cloudcore_k8s_index::TypedStoreExt;
use k8s_openapi::api::core::v1::{DaemonEndpoint, NodeDaemonEndpoints};
use kube::api::Patch;
use serde::Deserialize;
use std::{collections::BTreeMap, time::Duration};
use tracing::{debug, info};

/// A status report for one node.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct NodeStatusRequest {
    #[serde(rename = "UID", default)]
    pub uid: String,
    #[serde(default)]
    pub status: k8s::NodeStatus,
    /// Extended resources reported by device plugins, recorded as node annotations.
    #[serde(default)]
    pub extend_resources: BTreeMap<String, serde_json::Value>,
}

// === impl Upstream ===

impl Upstream {
    /// Registers a node on insert; refreshes its status on update.
    pub(super) async fn update_node_status(&self, msg: &Message) -> Result<Reply, UpstreamError> {
        let name = msg.resource_name()?;
        match msg.operation() {
            Operation::Insert => self.register_node(msg, name).await,
            Operation::Update => {
                let request = decode::<NodeStatusRequest>(msg, "node status")?;
                if !request.extend_resources.is_empty() {
                    let annotations = request
                        .extend_resources
                        .iter()
                        .map(|(resource, value)| (resource.clone(), value.to_string()))
                        .collect::<BTreeMap<_, _>>();
                    let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
                    self.inner
                        .store
                        .patch_typed::<k8s::Node>("", name, &Patch::Merge(patch), None)
                        .await?;
                }

                let mut node = self.inner.store.get_typed::<k8s::Node>("", name).await?;
                node.status = Some(merge_node_status(
                    &node,
                    request.status,
                    self.inner.config.node_update_frequency(),
                    self.inner.tunnel_port,
                ));
                let updated = self.inner.store.replace_status_typed("", &node).await?;
                debug!(node = %name, "Updated node status");
                Ok(Reply::Ack {
                    resource_version: updated.metadata.resource_version,
                })
            }
            _ => Err(UpstreamError::unsupported(msg)),
        }
    }

    async fn register_node(&self, msg: &Message, name: &str) -> Result<Reply, UpstreamError> {
        match self.inner.store.get_typed::<k8s::Node>("", name).await {
            Ok(_) => {
                info!(node = %name, "Node already registered");
                return Ok(Reply::ack());
            }
            Err(error) if error.is_not_found() => {}
            Err(error) => return Err(error.into()),
        }

        let mut node = decode::<k8s::Node>(msg, "node")?;
        node.metadata.name = Some(name.to_string());
        stamp_kubelet_port(&mut node, self.inner.tunnel_port);
        let created = self.inner.store.create_typed("", &node).await?;
        info!(node = %name, "Registered node");
        Ok(Reply::Ack {
            resource_version: created.metadata.resource_version,
        })
    }

    pub(super) async fn create_node(&self, msg: &Message) -> Result<Reply, UpstreamError> {
        let name = msg.resource_name()?;
        let mut node = decode::<k8s::Node>(msg, "node")?;
        node.metadata.name = Some(name.to_string());
        stamp_kubelet_port(&mut node, self.inner.tunnel_port);
        let created = self.inner.store.create_typed("", &node).await?;
        Reply::object(&created)
    }

    /// Applies a strategic-merge patch to the node's status.
    pub(super) async fn patch_node(&self, msg: &Message) -> Result<Reply, UpstreamError> {
        let name = msg.resource_name()?;
        let patch = decode::<serde_json::Value>(msg, "node patch")?;
        let patched = self
            .inner
            .store
            .patch_typed::<k8s::Node>("", name, &Patch::Strategic(patch), Some("status"))
            .await?;
        Reply::object(&patched)
    }

    /// Merges the labels and annotations reported by the node into the stored node.
    pub(super) async fn update_node(&self, msg: &Message) -> Result<Reply, UpstreamError> {
        let name = msg.resource_name()?;
        let reported = decode::<k8s::Node>(msg, "node")?;
        let mut node = self.inner.store.get_typed::<k8s::Node>("", name).await?;

        let labels = node.metadata.labels.get_or_insert_with(Default::default);
        labels.extend(reported.metadata.labels.unwrap_or_default());
        let annotations = node.metadata.annotations.get_or_insert_with(Default::default);
        annotations.extend(reported.metadata.annotations.unwrap_or_default());

        let patch = serde_json::json!({
            "metadata": {
                "labels": node.metadata.labels,
                "annotations": node.metadata.annotations,
            }
        });
        let patched = self
            .inner
            .store
            .patch_typed::<k8s::Node>("", name, &Patch::Strategic(patch), None)
            .await?;
        Ok(Reply::Ack {
            resource_version: patched.metadata.resource_version,
        })
    }
}

/// Combines a reported status with the stored node: stale heartbeats are refreshed, attached
/// volumes stay as the controller manager recorded them and the kubelet endpoint points at the
/// tunnel.
pub(super) fn merge_node_status(
    node: &k8s::Node,
    mut status: k8s::NodeStatus,
    frequency: Duration,
    tunnel_port: u16,
) -> k8s::NodeStatus {
    for cond in status.conditions.iter_mut().flatten() {
        for t in [
            &mut cond.last_heartbeat_time,
            &mut cond.last_transition_time,
        ] {
            let stale = t
                .as_ref()
                .map(|t| time::older_than(t, frequency))
                .unwrap_or(true);
            if stale {
                *t = time::now();
            }
        }
    }

    status.volumes_attached = node
        .status
        .as_ref()
        .and_then(|s| s.volumes_attached.clone());
    status.daemon_endpoints = Some(daemon_endpoints(tunnel_port));
    status
}

fn stamp_kubelet_port(node: &mut k8s::Node, port: u16) {
    node.status.get_or_insert_with(Default::default).daemon_endpoints =
        Some(daemon_endpoints(port));
}

fn daemon_endpoints(port: u16) -> NodeDaemonEndpoints {
    NodeDaemonEndpoints {
        kubelet_endpoint: Some(DaemonEndpoint { port: port.into() }),
        ..Default::default()
    }
}
