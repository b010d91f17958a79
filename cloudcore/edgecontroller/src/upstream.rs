//! Applies node-reported changes to the cluster.
//!
//! A single dispatcher drains the module inbox and classifies each request into a typed queue.
//! Every queue is served by its own pool of workers; each request yields exactly one response.

use cloudcore_core::{
    config::{Buffer, Load},
    modules, resource, Config, Inbox, Message, MessageLayer, Operation, ResourceError, StatusError,
};
use cloudcore_k8s_api::{self as k8s, rules::Rule, Resource, Status};
use cloudcore_k8s_index::{DynamicStore, Lister, StoreError, TypedStoreExt};
use kube::api::Patch;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{fmt, sync::Arc};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

mod nodes;
mod pods;


/// Namespace holding node leases.
pub const NODE_LEASE_NAMESPACE: &str = "kube-node-lease";

#[derive(Clone)]
pub struct Upstream {
    inner: Arc<Inner>,
}

/// Optional caches consulted before the store on queries.
#[derive(Clone, Default)]
pub struct Listers {
    pub configmaps: Option<Lister<k8s::ConfigMap>>,
    pub secrets: Option<Lister<k8s::Secret>>,
    pub nodes: Option<Lister<k8s::Node>>,
}

#[derive(Clone)]
struct Inner {
    store: Arc<dyn DynamicStore>,
    messages: MessageLayer,
    config: Config,
    tunnel_port: u16,
    listers: Listers,
    metrics: Option<UpstreamMetrics>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Queue {
    UpdatePodStatus,
    UpdateNodeStatus,
    QueryConfigMap,
    QuerySecret,
    PatchPod,
    DeletePod,
    CreatePod,
    CreateNode,
    PatchNode,
    UpdateNode,
    QueryNode,
    CreateLease,
    QueryLease,
    CreateCsr,
    QueryCsr,
    ServiceAccountToken,
    QueryPersistentVolume,
    QueryPersistentVolumeClaim,
    QueryVolumeAttachment,
    UpdateRuleStatus,
}

/// The outcome of a successfully handled request.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Reply {
    Object {
        object: serde_json::Value,
        resource_version: Option<String>,
    },
    Ack {
        resource_version: Option<String>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error("failed to decode {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("operation {op} is not supported for {resource}")]
    Unsupported { resource: String, op: Operation },
}

/// The body of an object reply, mirroring the `{Object, Err}` envelope edges decode.
#[derive(Debug, Serialize)]
struct ObjectResp<'a> {
    #[serde(rename = "Object")]
    object: Option<&'a serde_json::Value>,
    #[serde(rename = "Err")]
    err: Option<StatusError>,
}

#[derive(Clone, Debug)]
pub struct UpstreamMetrics {
    handled: Family<QueueLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct QueueLabels {
    queue: &'static str,
    outcome: &'static str,
}

/// Reported by the rule router after executing a rule.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecResult {
    #[serde(rename = "RuleID", default)]
    pub rule_id: String,
    #[serde(rename = "ProjectID", default)]
    pub project_id: String,
    pub status: String,
    #[serde(default)]
    pub error: ErrorMsg,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorMsg {
    #[serde(default)]
    pub detail: String,
}

// === impl Queue ===

impl Queue {
    pub const ALL: [Queue; 20] = [
        Queue::UpdatePodStatus,
        Queue::UpdateNodeStatus,
        Queue::QueryConfigMap,
        Queue::QuerySecret,
        Queue::PatchPod,
        Queue::DeletePod,
        Queue::CreatePod,
        Queue::CreateNode,
        Queue::PatchNode,
        Queue::UpdateNode,
        Queue::QueryNode,
        Queue::CreateLease,
        Queue::QueryLease,
        Queue::CreateCsr,
        Queue::QueryCsr,
        Queue::ServiceAccountToken,
        Queue::QueryPersistentVolume,
        Queue::QueryPersistentVolumeClaim,
        Queue::QueryVolumeAttachment,
        Queue::UpdateRuleStatus,
    ];

    /// Picks the queue serving `(resource_type, op)`, if any.
    pub fn classify(resource_type: &str, op: Operation) -> Option<Self> {
        use Operation as Op;
        let queue = match (resource_type, op) {
            (resource::NODE_STATUS, _) => Self::UpdateNodeStatus,
            (resource::NODE, Op::Insert) => Self::CreateNode,
            (resource::NODE, Op::Query) => Self::QueryNode,
            (resource::NODE, Op::Update) => Self::UpdateNode,
            (resource::NODE, Op::Patch) | (resource::NODE_PATCH, _) => Self::PatchNode,
            (resource::POD_STATUS, _) => Self::UpdatePodStatus,
            (resource::POD, Op::Delete) => Self::DeletePod,
            (resource::POD, Op::Insert) => Self::CreatePod,
            (resource::POD_PATCH, _) => Self::PatchPod,
            (resource::CONFIGMAP, Op::Query) => Self::QueryConfigMap,
            (resource::SECRET, Op::Query) => Self::QuerySecret,
            (resource::LEASE, Op::Insert | Op::Update) => Self::CreateLease,
            (resource::LEASE, Op::Query) => Self::QueryLease,
            (resource::CSR, Op::Insert) => Self::CreateCsr,
            (resource::CSR, Op::Query) => Self::QueryCsr,
            (resource::SERVICE_ACCOUNT_TOKEN, _) => Self::ServiceAccountToken,
            (resource::PERSISTENT_VOLUME, Op::Query) => Self::QueryPersistentVolume,
            (resource::PERSISTENT_VOLUME_CLAIM, Op::Query) => Self::QueryPersistentVolumeClaim,
            (resource::VOLUME_ATTACHMENT, Op::Query) => Self::QueryVolumeAttachment,
            (resource::RULE_STATUS, _) => Self::UpdateRuleStatus,
            _ => return None,
        };
        Some(queue)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::UpdatePodStatus => "update_pod_status",
            Self::UpdateNodeStatus => "update_node_status",
            Self::QueryConfigMap => "query_configmap",
            Self::QuerySecret => "query_secret",
            Self::PatchPod => "patch_pod",
            Self::DeletePod => "delete_pod",
            Self::CreatePod => "create_pod",
            Self::CreateNode => "create_node",
            Self::PatchNode => "patch_node",
            Self::UpdateNode => "update_node",
            Self::QueryNode => "query_node",
            Self::CreateLease => "create_lease",
            Self::QueryLease => "query_lease",
            Self::CreateCsr => "create_csr",
            Self::QueryCsr => "query_csr",
            Self::ServiceAccountToken => "service_account_token",
            Self::QueryPersistentVolume => "query_persistent_volume",
            Self::QueryPersistentVolumeClaim => "query_persistent_volume_claim",
            Self::QueryVolumeAttachment => "query_volume_attachment",
            Self::UpdateRuleStatus => "update_rule_status",
        }
    }

    pub fn capacity(self, buffer: &Buffer) -> usize {
        let cap = match self {
            Self::UpdatePodStatus => buffer.update_pod_status,
            Self::UpdateNodeStatus => buffer.update_node_status,
            Self::QueryConfigMap => buffer.query_configmap,
            Self::QuerySecret => buffer.query_secret,
            Self::PatchPod => buffer.patch_pod,
            Self::DeletePod => buffer.delete_pod,
            Self::CreatePod => buffer.create_pod,
            Self::CreateNode => buffer.create_node,
            Self::PatchNode => buffer.patch_node,
            Self::UpdateNode => buffer.update_node,
            Self::QueryNode => buffer.query_node,
            Self::CreateLease => buffer.create_lease,
            Self::QueryLease => buffer.query_lease,
            Self::CreateCsr => buffer.create_csr,
            Self::QueryCsr => buffer.query_csr,
            Self::ServiceAccountToken => buffer.service_account_token,
            Self::QueryPersistentVolume => buffer.query_persistent_volume,
            Self::QueryPersistentVolumeClaim => buffer.query_persistent_volume_claim,
            Self::QueryVolumeAttachment => buffer.query_volume_attachment,
            Self::UpdateRuleStatus => buffer.update_rule_status,
        };
        cap.max(1)
    }

    pub fn workers(self, load: &Load) -> usize {
        let n = match self {
            Self::UpdatePodStatus => load.update_pod_status_workers,
            Self::UpdateNodeStatus => load.update_node_status_workers,
            Self::QueryConfigMap => load.query_configmap_workers,
            Self::QuerySecret => load.query_secret_workers,
            Self::PatchPod => load.patch_pod_workers,
            Self::DeletePod => load.delete_pod_workers,
            Self::CreatePod => load.create_pod_workers,
            Self::CreateNode => load.create_node_workers,
            Self::PatchNode => load.patch_node_workers,
            Self::UpdateNode => load.update_node_workers,
            Self::QueryNode => load.query_node_workers,
            Self::CreateLease => load.create_lease_workers,
            Self::QueryLease => load.query_lease_workers,
            Self::CreateCsr => load.create_csr_workers,
            Self::QueryCsr => load.query_csr_workers,
            Self::ServiceAccountToken => load.service_account_token_workers,
            Self::QueryPersistentVolume => load.query_persistent_volume_workers,
            Self::QueryPersistentVolumeClaim => load.query_persistent_volume_claim_workers,
            Self::QueryVolumeAttachment => load.query_volume_attachment_workers,
            Self::UpdateRuleStatus => load.update_rule_status_workers,
        };
        n.max(1)
    }

    /// Node status replies are plain text: `OK` or the failure reason.
    fn replies_with_text(self) -> bool {
        matches!(self, Self::UpdateNodeStatus | Self::UpdateNode)
    }
}

impl fmt::Display for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// === impl Reply ===

impl Reply {
    pub(crate) fn object<K: Resource + Serialize>(obj: &K) -> Result<Self, UpstreamError> {
        let object = serde_json::to_value(obj).map_err(|source| UpstreamError::Decode {
            what: "object",
            source,
        })?;
        Ok(Self::Object {
            object,
            resource_version: obj.meta().resource_version.clone(),
        })
    }

    pub(crate) fn ack() -> Self {
        Self::Ack {
            resource_version: None,
        }
    }

    fn resource_version(&self) -> Option<&str> {
        match self {
            Self::Object {
                resource_version, ..
            }
            | Self::Ack { resource_version } => resource_version.as_deref(),
        }
    }
}

// === impl UpstreamError ===

impl UpstreamError {
    pub(crate) fn decode(what: &'static str) -> impl FnOnce(serde_json::Error) -> Self {
        move |source| Self::Decode { what, source }
    }

    fn unsupported(msg: &Message) -> Self {
        Self::Unsupported {
            resource: msg.resource().to_string(),
            op: msg.operation(),
        }
    }

    fn api_status(&self) -> Option<&Status> {
        match self {
            Self::Store(e) => e.api_status(),
            _ => None,
        }
    }
}

// === impl Upstream ===

impl Upstream {
    pub fn new(
        store: Arc<dyn DynamicStore>,
        messages: MessageLayer,
        config: Config,
        tunnel_port: u16,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                messages,
                config,
                tunnel_port,
                listers: Listers::default(),
                metrics: None,
            }),
        }
    }

    pub fn with_listers(mut self, listers: Listers) -> Self {
        Arc::make_mut(&mut self.inner).listers = listers;
        self
    }

    pub fn with_metrics(mut self, metrics: UpstreamMetrics) -> Self {
        Arc::make_mut(&mut self.inner).metrics = Some(metrics);
        self
    }

    /// Spawns the dispatcher and one worker pool per queue.
    pub fn spawn(self, mut inbox: Inbox, drain: drain::Watch) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();
        let mut senders = Vec::with_capacity(Queue::ALL.len());
        for queue in Queue::ALL {
            let (tx, rx) = async_channel::bounded::<Message>(queue.capacity(&self.inner.config.buffer));
            for worker in 0..queue.workers(&self.inner.config.load) {
                let this = self.clone();
                let rx = rx.clone();
                let drain = drain.clone();
                tasks.push(tokio::spawn(
                    async move {
                        let shutdown = drain.signaled();
                        tokio::pin!(shutdown);
                        loop {
                            tokio::select! {
                                _ = &mut shutdown => return,
                                msg = rx.recv() => match msg {
                                    Ok(msg) => this.handle(queue, &msg).await,
                                    Err(_) => return,
                                },
                            }
                        }
                    }
                    .instrument(info_span!("upstream", %queue, worker)),
                ));
            }
            senders.push((queue, tx));
        }

        tasks.push(tokio::spawn(
            async move {
                let shutdown = drain.signaled();
                tokio::pin!(shutdown);
                loop {
                    let msg = tokio::select! {
                        _ = &mut shutdown => {
                            info!("Stopping");
                            return;
                        }
                        msg = inbox.recv() => match msg {
                            Some(msg) => msg,
                            None => {
                                debug!("Inbox closed");
                                return;
                            }
                        },
                    };
                    let queue = msg
                        .resource_type()
                        .ok()
                        .and_then(|ty| Queue::classify(ty, msg.operation()));
                    let Some(queue) = queue else {
                        warn!(id = %msg.id(), resource = %msg.resource(), op = %msg.operation(), "Unsupported message");
                        let error = UpstreamError::unsupported(&msg);
                        self.respond(None, &msg, Err(error)).await;
                        continue;
                    };
                    let Some((_, tx)) = senders.iter().find(|(q, _)| *q == queue) else {
                        continue;
                    };
                    // Blocks when the pool is saturated so the bus applies backpressure.
                    if tx.send(msg).await.is_err() {
                        warn!(%queue, "Worker pool closed");
                        return;
                    }
                }
            }
            .instrument(info_span!("upstream", queue = "dispatch")),
        ));
        tasks
    }

    /// Handles one request from `queue` and emits its response.
    pub async fn handle(&self, queue: Queue, msg: &Message) {
        debug!(id = %msg.id(), resource = %msg.resource(), op = %msg.operation(), "Handling");
        let result = self.process(queue, msg).await;
        if let Err(error) = &result {
            warn!(id = %msg.id(), %queue, %error, "Failed to process message");
        }
        self.respond(Some(queue), msg, result).await;
    }

    async fn process(&self, queue: Queue, msg: &Message) -> Result<Reply, UpstreamError> {
        let ns = msg.namespace()?;
        match queue {
            Queue::UpdatePodStatus => self.update_pod_status(msg).await,
            Queue::UpdateNodeStatus => self.update_node_status(msg).await,
            Queue::DeletePod => self.delete_pod(msg).await,
            Queue::CreatePod => self.create_pod(msg).await,
            Queue::PatchPod => self.patch_pod(msg).await,
            Queue::CreateNode => self.create_node(msg).await,
            Queue::PatchNode => self.patch_node(msg).await,
            Queue::UpdateNode => self.update_node(msg).await,
            Queue::QueryNode => {
                let name = msg.resource_name()?;
                let cached = self.inner.listers.nodes.as_ref().and_then(|l| l.get("", name));
                self.query_cached::<k8s::Node>(cached, "", name).await
            }
            Queue::QueryConfigMap => {
                let name = msg.resource_name()?;
                let cached = self.inner.listers.configmaps.as_ref().and_then(|l| l.get(ns, name));
                self.query_cached::<k8s::ConfigMap>(cached, ns, name).await
            }
            Queue::QuerySecret => {
                let name = msg.resource_name()?;
                let cached = self.inner.listers.secrets.as_ref().and_then(|l| l.get(ns, name));
                self.query_cached::<k8s::Secret>(cached, ns, name).await
            }
            Queue::QueryLease => self.query::<k8s::Lease>(ns, msg.resource_name()?).await,
            Queue::QueryCsr => {
                self.query::<k8s::CertificateSigningRequest>("", msg.resource_name()?)
                    .await
            }
            Queue::QueryPersistentVolume => {
                self.query::<k8s::PersistentVolume>("", msg.resource_name()?)
                    .await
            }
            Queue::QueryPersistentVolumeClaim => {
                self.query::<k8s::PersistentVolumeClaim>(ns, msg.resource_name()?)
                    .await
            }
            Queue::QueryVolumeAttachment => {
                self.query::<k8s::VolumeAttachment>("", msg.resource_name()?)
                    .await
            }
            Queue::CreateLease => self.create_or_update_lease(msg).await,
            Queue::CreateCsr => {
                let csr = decode::<k8s::CertificateSigningRequest>(msg, "certificate signing request")?;
                let created = self.inner.store.create_typed("", &csr).await?;
                Reply::object(&created)
            }
            Queue::ServiceAccountToken => self.service_account_token(msg).await,
            Queue::UpdateRuleStatus => self.update_rule_status(msg).await,
        }
    }

    async fn respond(
        &self,
        queue: Option<Queue>,
        req: &Message,
        result: Result<Reply, UpstreamError>,
    ) {
        if let (Some(metrics), Some(queue)) = (&self.inner.metrics, queue) {
            metrics.record(queue, result.is_ok());
        }
        if req.id().is_empty() {
            return;
        }

        let text = queue.map(Queue::replies_with_text).unwrap_or(false);
        let mut rsp = Message::response_to(req, modules::EDGE_CONTROLLER);
        rsp = match (&result, text) {
            (Ok(reply), _) => {
                if let Some(rv) = reply.resource_version() {
                    rsp = rsp.with_resource_version(rv);
                }
                match reply {
                    Reply::Object { object, .. } => rsp.fill_body(&ObjectResp {
                        object: Some(object),
                        err: None,
                    }),
                    Reply::Ack { .. } => rsp.fill_body(&"OK"),
                }
            }
            (Err(error), true) => rsp.fill_body(&error.to_string()),
            (Err(error), false) => match error.api_status() {
                Some(status) => rsp.fill_body(&ObjectResp {
                    object: None,
                    err: Some(StatusError {
                        status: status.clone(),
                    }),
                }),
                None => rsp.fill_body(&error.to_string()),
            },
        };

        if let Err(error) = self.inner.messages.response(rsp).await {
            warn!(id = %req.id(), %error, "Failed to send response");
        }
    }

    async fn query<K>(&self, ns: &str, name: &str) -> Result<Reply, UpstreamError>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned + Serialize + Send + Sync + 'static,
    {
        let obj = self.inner.store.get_typed::<K>(ns, name).await?;
        Reply::object(&obj)
    }

    async fn query_cached<K>(
        &self,
        cached: Option<K>,
        ns: &str,
        name: &str,
    ) -> Result<Reply, UpstreamError>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned + Serialize + Send + Sync + 'static,
    {
        match cached {
            Some(obj) => Reply::object(&obj),
            None => self.query::<K>(ns, name).await,
        }
    }

    async fn create_or_update_lease(&self, msg: &Message) -> Result<Reply, UpstreamError> {
        let ns = msg.namespace()?;
        let name = msg.resource_name()?;
        let mut lease = decode::<k8s::Lease>(msg, "lease")?;
        lease.metadata.name = Some(name.to_string());
        lease.metadata.namespace = Some(ns.to_string());

        match self.inner.store.create_typed(ns, &lease).await {
            Ok(created) => Reply::object(&created),
            Err(error) if error.is_already_exists() => {
                let mut current = self.inner.store.get_typed::<k8s::Lease>(ns, name).await?;
                current.spec = lease.spec;
                let updated = self.inner.store.replace_typed(ns, &current).await?;
                Reply::object(&updated)
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn service_account_token(&self, msg: &Message) -> Result<Reply, UpstreamError> {
        let ns = msg.namespace()?;
        let name = msg.resource_name()?;
        let request = decode::<serde_json::Value>(msg, "token request")?;
        let resource = kube::api::ApiResource::erase::<k8s::ServiceAccount>(&());
        let token = self
            .inner
            .store
            .create_subresource(&resource, ns, name, "token", request)
            .await?;
        Ok(Reply::Object {
            object: token,
            resource_version: None,
        })
    }

    async fn update_rule_status(&self, msg: &Message) -> Result<Reply, UpstreamError> {
        let ns = msg.namespace()?;
        let rule_id = msg.resource_name()?;
        let result = decode::<ExecResult>(msg, "rule execution result")?;
        let rule = self.inner.store.get_typed::<Rule>(ns, rule_id).await?;

        let mut status = rule.status.unwrap_or_default();
        match result.status.as_str() {
            "SUCCESS" => status.success_messages += 1,
            "FAIL" => {
                status.fail_messages += 1;
                status.errors = vec![result.error.detail];
            }
            other => debug!(status = %other, "Ignoring rule result"),
        }
        let patch = serde_json::json!({ "status": status });
        let patched = self
            .inner
            .store
            .patch_typed::<Rule>(ns, rule_id, &Patch::Merge(patch), Some("status"))
            .await?;
        Ok(Reply::Ack {
            resource_version: patched.metadata.resource_version,
        })
    }
}

/// Decodes the message content, accepting JSON values and JSON documents carried as strings.
pub(crate) fn decode<T: DeserializeOwned>(msg: &Message, what: &'static str) -> Result<T, UpstreamError> {
    msg.content_to().map_err(UpstreamError::decode(what))
}

// === impl UpstreamMetrics ===

impl UpstreamMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let handled = Family::<QueueLabels, Counter>::default();
        reg.register(
            "requests",
            "Total number of upstream requests handled by queue and outcome",
            handled.clone(),
        );
        Self { handled }
    }

    fn record(&self, queue: Queue, ok: bool) {
        self.handled
            .get_or_create(&QueueLabels {
                queue: queue.name(),
                outcome: if ok { "success" } else { "failure" },
            })
            .inc();
    }
}
