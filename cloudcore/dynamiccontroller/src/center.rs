//! The application center executes resource operations on behalf of edge nodes.
//!
//! Each inbound message carries one [`Application`]: the center replays it against the API server
//! and answers with the same application, now `Approved` with the response body or `Rejected`
//! with the reason. Watches are not answered with a stream; they register a listener whose events
//! are pushed to the node as separate messages. Nodes periodically send the full set of watches
//! they hold so that listeners lost in either direction are repaired.

use crate::{
    filter::Filters,
    handler::{HandlerCenter, HandlerError},
    listener::SelectorListener,
    ListOptions,
};
use cloudcore_core::{
    application::parse_key, modules, resource, Application, ApplicationError, ApplicationStatus,
    Config, Gvr, Inbox, Message, MessageLayer, Operation, PatchInfo, ResourceError, StatusError,
    Verb,
};
use cloudcore_k8s_api::{selector::InvalidSelector, ApiResource, DynamicObject, Status};
use cloudcore_k8s_index::{
    store::{delete_params, stamp_types},
    DynamicStore, StoreError,
};
use k8s_openapi::{
    api::authorization::v1::{ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec},
    apimachinery::pkg::apis::meta::v1::DeleteOptions,
};
use kube::api::{Patch, PatchParams};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use serde::Serialize;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

#[cfg(test)]
mod tests;

/// Resource suffix of the messages that carry a node's complete set of watches.
pub const WATCH_APP_SYNC: &str = "watchappsync";

/// Resource type of application responses.
pub const APPLICATION_RESOURCE: &str = "Application";

const IGNORE: &str = "ignore";

/// Field manager for server-side apply patches that do not name one.
const FIELD_MANAGER: &str = "cloudcore";

const MERGE_PATCH: &str = "application/merge-patch+json";
const STRATEGIC_MERGE_PATCH: &str = "application/strategic-merge-patch+json";
const APPLY_PATCH: &str = "application/apply-patch+yaml";

#[derive(Clone)]
pub struct Center {
    inner: Arc<Inner>,
}

#[derive(Clone)]
struct Inner {
    store: Arc<dyn DynamicStore>,
    handlers: HandlerCenter,
    messages: MessageLayer,
    filters: Filters,
    config: Config,
    metrics: Option<CenterMetrics>,
}

#[derive(Debug, thiserror::Error)]
pub enum CenterError {
    #[error(transparent)]
    Application(#[from] ApplicationError),

    #[error("invalid selector: {0}")]
    Selector(#[from] InvalidSelector),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error("message from node {message} carries an application of node {application}")]
    NodeMismatch {
        message: String,
        application: String,
    },

    #[error("node {node} may not {verb} {gvr}")]
    Forbidden { node: String, verb: String, gvr: Gvr },

    #[error("unsupported Application Verb type: {0}")]
    UnsupportedVerb(String),

    #[error("unsupported patch type: {0}")]
    UnsupportedPatchType(String),

    #[error("failed to decode patch data: {0}")]
    PatchData(#[source] serde_json::Error),

    #[error("failed to decode apply patch data: {0}")]
    ApplyPatchData(#[source] serde_yaml::Error),

    #[error("failed to encode response: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Clone, Debug)]
pub struct CenterMetrics {
    applications: Family<ApplicationLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ApplicationLabels {
    verb: String,
    status: &'static str,
}

// === impl Center ===

impl Center {
    pub fn new(
        store: Arc<dyn DynamicStore>,
        handlers: HandlerCenter,
        messages: MessageLayer,
        filters: Filters,
        config: Config,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                handlers,
                messages,
                filters,
                config,
                metrics: None,
            }),
        }
    }

    pub fn with_metrics(mut self, metrics: CenterMetrics) -> Self {
        Arc::make_mut(&mut self.inner).metrics = Some(metrics);
        self
    }

    pub fn handlers(&self) -> &HandlerCenter {
        &self.inner.handlers
    }

    /// Processes applications one at a time until shutdown.
    pub fn spawn(self, mut inbox: Inbox, drain: drain::Watch) -> JoinHandle<()> {
        tokio::spawn(
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
                    self.process(msg).await;
                }
            }
            .instrument(info_span!("application_center")),
        )
    }

    /// Handles one inbound message. Every decodable application is answered.
    pub async fn process(&self, msg: Message) {
        if msg.resource().ends_with(WATCH_APP_SYNC) {
            self.process_watch_sync(&msg).await;
            return;
        }

        let decoded = msg
            .content_data()
            .map_err(ApplicationError::Decode)
            .and_then(|bytes| Application::from_bytes(&bytes));
        let mut app = match decoded {
            Ok(app) => app,
            Err(error) => {
                warn!(id = %msg.id(), %error, "Failed to decode application");
                return;
            }
        };
        app.identifier();
        debug!(id = %app.id, %app, "Processing application");

        let result = self.process_application(&msg, &mut app).await;
        self.respond(app, result).await;
    }

    /// Executes an application and returns the response body.
    pub async fn process_application(
        &self,
        msg: &Message,
        app: &mut Application,
    ) -> Result<Vec<u8>, CenterError> {
        app.begin_processing();

        if self.inner.config.enable_authorization {
            let node = msg.node_id()?;
            if node != app.nodename {
                return Err(CenterError::NodeMismatch {
                    message: node.to_string(),
                    application: app.nodename.clone(),
                });
            }
        }

        if self.inner.config.is_pass_through(&app.key, app.verb.as_str()) {
            return Ok(self.inner.store.raw_get(&app.key).await?);
        }

        let (gvr, ns, name) = parse_key(&app.key);
        if app.verb == Verb::Watch || self.inner.config.enable_authorization {
            self.authorize(app, &gvr, &ns, &name).await?;
        }

        match &app.verb {
            Verb::Get => {
                let resource = self.resolve(&gvr).await?;
                let mut obj = self.inner.store.get(&resource, &ns, &name).await?;
                stamp_types(&mut obj, &resource);
                self.inner.filters.apply(&app.nodename, &mut obj);
                encode(&obj)
            }

            Verb::List => {
                let options = app.option_to::<ListOptions>()?;
                let resource = self.resolve(&gvr).await?;
                let mut list = self
                    .inner
                    .store
                    .list(&resource, &ns, &options.to_params())
                    .await?;
                // Filters match on kind, which list items omit.
                for obj in &mut list.items {
                    stamp_types(obj, &resource);
                }
                self.inner.filters.apply_list(&app.nodename, &mut list);
                encode(&list)
            }

            Verb::Watch => {
                self.add_watch(app).await?;
                Ok(Vec::new())
            }

            Verb::Create => {
                let resource = self.resolve(&gvr).await?;
                if app.subresource.is_empty() {
                    let obj = app.req_body_to::<DynamicObject>()?;
                    let created = self.inner.store.create(&resource, &ns, &obj).await?;
                    encode(&created)
                } else {
                    let body = app.req_body_to::<serde_json::Value>()?;
                    let created = self
                        .inner
                        .store
                        .create_subresource(&resource, &ns, &name, &app.subresource, body)
                        .await?;
                    encode(&created)
                }
            }

            Verb::Update => {
                let resource = self.resolve(&gvr).await?;
                let obj = app.req_body_to::<DynamicObject>()?;
                let subresource = (!app.subresource.is_empty()).then_some(app.subresource.as_str());
                let updated = self
                    .inner
                    .store
                    .replace(&resource, &ns, &obj, subresource)
                    .await?;
                encode(&updated)
            }

            Verb::UpdateStatus => {
                let resource = self.resolve(&gvr).await?;
                let obj = app.req_body_to::<DynamicObject>()?;
                let updated = self
                    .inner
                    .store
                    .replace(&resource, &ns, &obj, Some("status"))
                    .await?;
                encode(&updated)
            }

            Verb::Delete => {
                let resource = self.resolve(&gvr).await?;
                let options = app.option_to::<DeleteOptions>()?;
                self.inner
                    .store
                    .delete(&resource, &ns, &name, &delete_params(options))
                    .await?;
                Ok(Vec::new())
            }

            Verb::Patch => {
                let resource = self.resolve(&gvr).await?;
                // Patch details travel in the option; older nodes put them in the body.
                let info = if app.option.is_empty() {
                    app.req_body_to::<PatchInfo>()?
                } else {
                    app.option_to::<PatchInfo>()?
                };
                let target = if info.name.is_empty() {
                    name.as_str()
                } else {
                    info.name.as_str()
                };
                let (patch, params) = patch_request(&info)?;
                let patched = self
                    .inner
                    .store
                    .patch(
                        &resource,
                        &ns,
                        target,
                        &patch,
                        &params,
                        info.subresources.first().map(String::as_str),
                    )
                    .await?;
                encode(&patched)
            }

            Verb::Other(verb) => Err(CenterError::UnsupportedVerb(verb.clone())),
        }
    }

    /// Reconciles a node's listeners with the watches the node reports holding. Watches the node
    /// holds but the cloud does not are registered; listeners the node no longer holds are
    /// removed. The response carries the reason for every watch that could not be registered.
    pub async fn process_watch_sync(&self, msg: &Message) {
        let node = match msg.node_id() {
            Ok(node) => node.to_string(),
            Err(error) => {
                warn!(id = %msg.id(), resource = %msg.resource(), %error, "Invalid watch sync");
                return;
            }
        };
        let held = match msg.content_to::<BTreeMap<String, Application>>() {
            Ok(apps) => apps,
            Err(error) => {
                warn!(id = %msg.id(), %node, %error, "Failed to decode watch sync");
                return;
            }
        };

        let existing = self.inner.handlers.listeners_for_node(&node);
        let held_ids = held.keys().cloned().collect::<BTreeSet<_>>();
        let mut rejected = BTreeMap::new();
        for (id, mut app) in held {
            if existing.contains_key(&id) {
                continue;
            }
            app.id = id.clone();
            let (gvr, ns, name) = parse_key(&app.key);
            let added = match self.authorize(&app, &gvr, &ns, &name).await {
                Ok(()) => self.add_watch(&app).await,
                Err(error) => Err(error),
            };
            if let Err(error) = added {
                info!(%node, %id, %error, "Rejected watch");
                rejected.insert(id, error.to_string());
            }
        }
        for id in existing.keys().filter(|id| !held_ids.contains(*id)) {
            self.inner.handlers.delete_listener(&node, id);
        }
        debug!(%node, listeners = self.inner.handlers.listeners_for_node(&node).len(), "Synced watches");

        let rsp = Message::response_to(msg, modules::DYNAMIC_CONTROLLER).fill_body(&rejected);
        if let Err(error) = self.inner.messages.response(rsp).await {
            warn!(%node, %error, "Failed to respond to watch sync");
        }
    }

    async fn add_watch(&self, app: &Application) -> Result<(), CenterError> {
        let options = app.option_to::<ListOptions>()?;
        let listener = SelectorListener::from_application(app, &options)?;
        self.inner.handlers.add_listener(listener, &options).await?;
        Ok(())
    }

    /// Asks the API server whether the application's node may perform the application.
    async fn authorize(
        &self,
        app: &Application,
        gvr: &Gvr,
        namespace: &str,
        name: &str,
    ) -> Result<(), CenterError> {
        let (verb, subresource) = match &app.verb {
            Verb::UpdateStatus => ("update", "status"),
            verb => (verb.as_str(), app.subresource.as_str()),
        };
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        let review = SubjectAccessReview {
            spec: SubjectAccessReviewSpec {
                user: Some(format!("system:node:{}", app.nodename)),
                groups: Some(vec!["system:nodes".to_string()]),
                resource_attributes: Some(ResourceAttributes {
                    group: Some(gvr.group.clone()),
                    version: Some(gvr.version.clone()),
                    resource: Some(gvr.resource.clone()),
                    namespace: non_empty(namespace),
                    name: non_empty(name),
                    subresource: non_empty(subresource),
                    verb: Some(verb.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        if self.inner.store.review_access(review).await? {
            return Ok(());
        }
        Err(CenterError::Forbidden {
            node: app.nodename.clone(),
            verb: verb.to_string(),
            gvr: gvr.clone(),
        })
    }

    async fn resolve(&self, gvr: &Gvr) -> Result<ApiResource, CenterError> {
        Ok(self.inner.store.resolve(gvr).await?)
    }

    /// Answers the node with the processed application. The response's parent is the
    /// application's ID.
    async fn respond(&self, mut app: Application, result: Result<Vec<u8>, CenterError>) {
        let status = match result {
            Ok(body) => {
                app.resp_body = body;
                ApplicationStatus::Approved
            }
            Err(error) => {
                info!(id = %app.id, %app, %error, "Rejected application");
                app.reason = error.to_string();
                app.error = error.api_status().map(|status| StatusError { status });
                ApplicationStatus::Rejected
            }
        };
        if let Err(error) = app.set_status(status) {
            warn!(id = %app.id, %error, "Failed to update application status");
        }
        if let Some(metrics) = &self.inner.metrics {
            metrics.record(&app.verb, status);
        }

        let resource = match resource::build_resource(
            &app.nodename,
            IGNORE,
            APPLICATION_RESOURCE,
            IGNORE,
        ) {
            Ok(resource) => resource,
            Err(error) => {
                warn!(id = %app.id, %error, "Failed to build response resource");
                return;
            }
        };
        let rsp = Message::new(app.id.clone())
            .build_router(
                modules::DYNAMIC_CONTROLLER,
                modules::GROUP_RESOURCE,
                resource,
                Operation::Response,
            )
            .fill_body(&app);
        match self.inner.messages.response(rsp).await {
            Ok(()) => debug!(id = %app.id, status = ?app.status, "Responded"),
            Err(error) => warn!(id = %app.id, %error, "Failed to send response"),
        }
    }
}

impl std::fmt::Debug for Center {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Center")
            .field("handlers", &self.inner.handlers)
            .field("filters", &self.inner.filters)
            .finish()
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CenterError> {
    serde_json::to_vec(value).map_err(CenterError::Encode)
}

fn patch_request(
    info: &PatchInfo,
) -> Result<(Patch<serde_json::Value>, PatchParams), CenterError> {
    let json = || serde_json::from_slice::<serde_json::Value>(&info.data).map_err(CenterError::PatchData);
    let mut params = PatchParams {
        dry_run: !info.options.dry_run.is_empty(),
        field_manager: info.options.field_manager.clone(),
        ..Default::default()
    };
    let patch = match info.patch_type.as_str() {
        MERGE_PATCH => Patch::Merge(json()?),
        STRATEGIC_MERGE_PATCH => Patch::Strategic(json()?),
        APPLY_PATCH => {
            params.force = info.options.force.unwrap_or(false);
            params
                .field_manager
                .get_or_insert_with(|| FIELD_MANAGER.to_string());
            Patch::Apply(serde_yaml::from_slice::<serde_json::Value>(&info.data).map_err(CenterError::ApplyPatchData)?)
        }
        other => return Err(CenterError::UnsupportedPatchType(other.to_string())),
    };
    Ok((patch, params))
}

// === impl CenterError ===

impl CenterError {
    /// The structural API status reported to the node, if the error has one.
    pub fn api_status(&self) -> Option<Status> {
        match self {
            Self::Store(error) => error.api_status().cloned(),
            Self::Handler(HandlerError::Expired(error)) => {
                StoreError::gone(error.to_string()).api_status().cloned()
            }
            Self::Forbidden { .. } => StoreError::forbidden(self.to_string()).api_status().cloned(),
            _ => None,
        }
    }
}

// === impl CenterMetrics ===

impl CenterMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let applications = Family::<ApplicationLabels, Counter>::default();
        reg.register(
            "applications",
            "Total number of applications processed by verb and status",
            applications.clone(),
        );
        Self { applications }
    }

    fn record(&self, verb: &Verb, status: ApplicationStatus) {
        let status = match status {
            ApplicationStatus::Approved => "approved",
            _ => "rejected",
        };
        self.applications
            .get_or_create(&ApplicationLabels {
                verb: verb.to_string(),
                status,
            })
            .inc();
    }
}
