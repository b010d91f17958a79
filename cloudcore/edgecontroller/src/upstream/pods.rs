use super::{decode, Reply, Upstream, UpstreamError};
use cloudcore_core::{modules, resource, Message, Operation};
use cloudcore_k8s_api::{self as k8s, time, ObjectMeta};
use cloudcore_k8s_index::{store::delete_params, TypedStoreExt};
use k8s_openapi::{
    api::core::v1::{ContainerState, ContainerStatus, PodCondition},
    apimachinery::pkg::apis::meta::v1::DeleteOptions,
};
use kube::api::{DeleteParams, Patch, Preconditions};
use serde::Deserialize;
use tracing::{debug, info, warn};

/// A status report for one pod.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct PodStatusRequest {
    #[serde(rename = "UID", default)]
    pub uid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: k8s::PodStatus,
}

/// The two body shapes accepted for pod deletion.
#[derive(Debug, PartialEq)]
pub(super) enum DeleteRequest {
    Uid(String),
    Options(DeleteOptions),
}

const READY: &str = "Ready";
const INITIALIZED: &str = "Initialized";

// === impl Upstream ===

impl Upstream {
    pub(super) async fn update_pod_status(&self, msg: &Message) -> Result<Reply, UpstreamError> {
        if msg.operation() != Operation::Update {
            return Err(UpstreamError::unsupported(msg));
        }
        let ns = msg.namespace()?;
        let node = msg.node_id()?;
        let requests = match msg.resource_name() {
            Ok(_) => vec![decode::<PodStatusRequest>(msg, "pod status")?],
            Err(_) => decode::<Vec<PodStatusRequest>>(msg, "pod statuses")?,
        };

        for request in requests {
            let pod = match self.inner.store.get_typed::<k8s::Pod>(ns, &request.name).await {
                Ok(pod) => pod,
                Err(error) if error.is_not_found() => {
                    warn!(id = %msg.id(), %ns, name = %request.name, "Pod not found; asking node to delete it");
                    self.send_pod_delete(node, ns, &request.name).await;
                    continue;
                }
                Err(error) => {
                    warn!(id = %msg.id(), %ns, name = %request.name, %error, "Failed to get pod");
                    continue;
                }
            };

            let mut pod = pod;
            let status = merge_pod_status(&pod, request.status);
            pod.status = Some(status);
            let updated = match self.inner.store.replace_status_typed(ns, &pod).await {
                Ok(updated) => updated,
                Err(error) => {
                    warn!(id = %msg.id(), %ns, name = %request.name, %error, "Failed to update pod status");
                    continue;
                }
            };
            debug!(%ns, name = %request.name, "Updated pod status");

            if should_force_delete(&updated) {
                let params = DeleteParams {
                    grace_period_seconds: Some(0),
                    ..Default::default()
                };
                match self
                    .inner
                    .store
                    .delete_typed::<k8s::Pod>(ns, &request.name, &params)
                    .await
                {
                    Ok(()) => info!(%ns, name = %request.name, "Deleted terminated pod"),
                    Err(error) => {
                        warn!(%ns, name = %request.name, %error, "Failed to delete terminated pod")
                    }
                }
            }
        }
        Ok(Reply::ack())
    }

    pub(super) async fn delete_pod(&self, msg: &Message) -> Result<Reply, UpstreamError> {
        let ns = msg.namespace()?;
        let name = msg.resource_name()?;
        let params = match DeleteRequest::from_message(msg)? {
            DeleteRequest::Uid(uid) => DeleteParams {
                grace_period_seconds: Some(0),
                preconditions: Some(Preconditions {
                    uid: Some(uid),
                    resource_version: None,
                }),
                ..Default::default()
            },
            DeleteRequest::Options(options) => delete_params(options),
        };

        match self
            .inner
            .store
            .delete_typed::<k8s::Pod>(ns, name, &params)
            .await
        {
            Ok(()) => {
                info!(%ns, %name, "Deleted pod");
                Ok(Reply::ack())
            }
            Err(error) if error.is_not_found() => {
                debug!(%ns, %name, "Pod already deleted");
                Ok(Reply::ack())
            }
            Err(error) if error.is_conflict() && error.to_string().contains("Precondition failed") => {
                debug!(%ns, %name, "Pod was recreated; leaving it in place");
                Ok(Reply::ack())
            }
            Err(error) => Err(error.into()),
        }
    }

    pub(super) async fn create_pod(&self, msg: &Message) -> Result<Reply, UpstreamError> {
        let ns = msg.namespace()?;
        let mut pod = decode::<k8s::Pod>(msg, "pod")?;
        pod.metadata.namespace = Some(ns.to_string());
        let created = self.inner.store.create_typed(ns, &pod).await?;
        Reply::object(&created)
    }

    /// Applies a strategic-merge patch to the pod's status.
    pub(super) async fn patch_pod(&self, msg: &Message) -> Result<Reply, UpstreamError> {
        let ns = msg.namespace()?;
        let name = msg.resource_name()?;
        let patch = decode::<serde_json::Value>(msg, "pod patch")?;
        let patched = self
            .inner
            .store
            .patch_typed::<k8s::Pod>(ns, name, &Patch::Strategic(patch), Some("status"))
            .await?;
        Reply::object(&patched)
    }

    async fn send_pod_delete(&self, node: &str, ns: &str, name: &str) {
        let res = match resource::build_resource(node, ns, resource::POD, name) {
            Ok(res) => res,
            Err(error) => {
                warn!(%error, "Failed to build message resource");
                return;
            }
        };
        let pod = k8s::Pod {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let msg = Message::new("")
            .build_router(
                modules::EDGE_CONTROLLER,
                modules::GROUP_RESOURCE,
                res,
                Operation::Delete,
            )
            .fill_body(&pod);
        if let Err(error) = self.inner.messages.send(msg).await {
            warn!(%error, "Failed to send pod delete");
        }
    }
}

// === impl DeleteRequest ===

impl DeleteRequest {
    /// A bare string is a pod UID unless it holds a JSON document.
    pub(super) fn from_message(msg: &Message) -> Result<Self, UpstreamError> {
        match &msg.content {
            serde_json::Value::String(s) if !s.trim_start().starts_with('{') => {
                Ok(Self::Uid(s.clone()))
            }
            _ => decode::<DeleteOptions>(msg, "delete options").map(Self::Options),
        }
    }
}

/// Combines a reported status with the stored pod, keeping the timestamps the API server owns
/// stable across reports.
pub(super) fn merge_pod_status(pod: &k8s::Pod, mut status: k8s::PodStatus) -> k8s::PodStatus {
    let old = pod.status.clone().unwrap_or_default();

    for ty in [READY, INITIALIZED] {
        let previous = condition(&old, ty).cloned();
        if let Some(cond) = condition_mut(&mut status, ty) {
            cond.last_transition_time = match previous {
                Some(prev) if prev.status == cond.status => prev.last_transition_time,
                _ => time::now(),
            };
        }
    }

    status.start_time = match old.start_time {
        Some(t) => Some(t),
        None => status.start_time.or_else(time::now),
    };

    normalize(pod, &mut status);
    status
}

fn condition<'s>(status: &'s k8s::PodStatus, ty: &str) -> Option<&'s PodCondition> {
    status.conditions.iter().flatten().find(|c| c.type_ == ty)
}

fn condition_mut<'s>(status: &'s mut k8s::PodStatus, ty: &str) -> Option<&'s mut PodCondition> {
    status
        .conditions
        .iter_mut()
        .flatten()
        .find(|c| c.type_ == ty)
}

/// Truncates timestamps to seconds and orders container statuses deterministically.
fn normalize(pod: &k8s::Pod, status: &mut k8s::PodStatus) {
    if let Some(t) = status.start_time.as_mut() {
        time::normalize(t);
    }
    for cond in status.conditions.iter_mut().flatten() {
        if let Some(t) = cond.last_probe_time.as_mut() {
            time::normalize(t);
        }
        if let Some(t) = cond.last_transition_time.as_mut() {
            time::normalize(t);
        }
    }

    for cs in status.container_statuses.iter_mut().flatten() {
        normalize_container(cs);
    }
    if let Some(statuses) = status.container_statuses.as_mut() {
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
    }

    for cs in status.init_container_statuses.iter_mut().flatten() {
        normalize_container(cs);
    }
    if let Some(statuses) = status.init_container_statuses.as_mut() {
        let order = pod
            .spec
            .iter()
            .flat_map(|s| s.init_containers.iter().flatten())
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>();
        statuses.sort_by_key(|s| {
            order
                .iter()
                .position(|n| *n == s.name)
                .unwrap_or(order.len())
        });
    }
}

fn normalize_container(cs: &mut ContainerStatus) {
    for state in [cs.state.as_mut(), cs.last_state.as_mut()].into_iter().flatten() {
        normalize_state(state);
    }
}

fn normalize_state(state: &mut ContainerState) {
    if let Some(t) = state.running.as_mut().and_then(|r| r.started_at.as_mut()) {
        time::normalize(t);
    }
    if let Some(terminated) = state.terminated.as_mut() {
        if let Some(t) = terminated.started_at.as_mut() {
            time::normalize(t);
        }
        if let Some(t) = terminated.finished_at.as_mut() {
            time::normalize(t);
        }
    }
}

/// A terminating pod that has finished and has no running containers can be removed at once.
pub(super) fn should_force_delete(pod: &k8s::Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_none() {
        return false;
    }
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if !matches!(status.phase.as_deref(), Some("Succeeded" | "Failed")) {
        return false;
    }
    status.container_statuses.iter().flatten().all(|cs| {
        cs.state
            .as_ref()
            .map(|s| s.terminated.is_some() || s.waiting.is_some())
            .unwrap_or(false)
    })
}
