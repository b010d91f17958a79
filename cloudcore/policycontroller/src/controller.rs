use crate::{
    plan::{plan, Plan},
    queue::WorkQueue,
    rbac::{Rbac, RbacError, ServiceAccountUser},
};
use cloudcore_core::{modules, resource, Message, MessageLayer, Operation};
use cloudcore_k8s_api::{
    policy::{AccessSpec, AccessStatus, ServiceAccountAccess},
    ClusterRole, ClusterRoleBinding, ObjectMeta, Pod, ResourceExt, Role, RoleBinding,
    ServiceAccount,
};
use cloudcore_k8s_index::{
    DynamicStore, EventType, Lister, LocationCache, ObjectKey, StoreError, TypedStoreExt,
    WatchEvent,
};
use kube::api::DeleteParams;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, info_span, warn, Instrument};


/// Delay before a failed reconcile is retried.
const REQUEUE_DELAY: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

#[derive(Clone)]
struct Inner {
    store: Arc<dyn DynamicStore>,
    messages: MessageLayer,
    locations: LocationCache,
    listers: Listers,
    queue: WorkQueue,
    metrics: Option<ControllerMetrics>,
}

#[derive(Clone, Debug)]
pub struct Listers {
    pub accesses: Lister<ServiceAccountAccess>,
    pub service_accounts: Lister<ServiceAccount>,
    pub pods: Lister<Pod>,
    pub rbac: Rbac,
}

/// Event queues for the access objects and every kind that can change one.
#[derive(Debug)]
pub struct Events {
    pub accesses: mpsc::Receiver<WatchEvent<ServiceAccountAccess>>,
    pub service_accounts: mpsc::Receiver<WatchEvent<ServiceAccount>>,
    pub pods: mpsc::Receiver<WatchEvent<Pod>>,
    pub roles: mpsc::Receiver<WatchEvent<Role>>,
    pub cluster_roles: mpsc::Receiver<WatchEvent<ClusterRole>>,
    pub role_bindings: mpsc::Receiver<WatchEvent<RoleBinding>>,
    pub cluster_role_bindings: mpsc::Receiver<WatchEvent<ClusterRoleBinding>>,
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Rbac(#[from] RbacError),
}

#[derive(Clone, Debug)]
pub struct ControllerMetrics {
    reconciles: Family<ReconcileLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ReconcileLabels {
    outcome: &'static str,
}

// === impl Controller ===

impl Controller {
    pub fn new(
        store: Arc<dyn DynamicStore>,
        messages: MessageLayer,
        locations: LocationCache,
        listers: Listers,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                messages,
                locations,
                listers,
                queue: WorkQueue::default(),
                metrics: None,
            }),
        }
    }

    pub fn with_metrics(mut self, metrics: ControllerMetrics) -> Self {
        Arc::make_mut(&mut self.inner).metrics = Some(metrics);
        self
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.inner.queue
    }

    /// Spawns a loop per event queue, each enqueuing the access objects an event may affect, and
    /// a single worker that reconciles them.
    pub fn spawn(self, events: Events, drain: drain::Watch) -> Vec<JoinHandle<()>> {
        let Events {
            accesses,
            service_accounts,
            pods,
            roles,
            cluster_roles,
            role_bindings,
            cluster_role_bindings,
        } = events;

        let mut tasks = vec![
            self.watch("serviceaccountaccesses", accesses, drain.clone(), |ctl, ev| {
                ctl.queue().add(ev.object.key());
            }),
            self.watch("serviceaccounts", service_accounts, drain.clone(), |ctl, ev| {
                for key in ctl.keys_for_service_account(&ev.object) {
                    ctl.queue().add(key);
                }
            }),
            self.watch("roles", roles, drain.clone(), |ctl, ev| {
                ctl.enqueue_affected(|rbac, user| rbac.role_affects(user, &ev.object));
            }),
            self.watch("clusterroles", cluster_roles, drain.clone(), |ctl, ev| {
                ctl.enqueue_affected(|rbac, user| rbac.cluster_role_affects(user, &ev.object));
            }),
            self.watch("rolebindings", role_bindings, drain.clone(), |ctl, ev| {
                ctl.enqueue_affected(|rbac, user| rbac.role_binding_affects(user, &ev.object));
            }),
            self.watch(
                "clusterrolebindings",
                cluster_role_bindings,
                drain.clone(),
                |ctl, ev| {
                    ctl.enqueue_affected(|rbac, user| {
                        rbac.cluster_role_binding_affects(user, &ev.object)
                    });
                },
            ),
        ];

        let ctl = self.clone();
        let pods_drain = drain.clone();
        let mut pods = pods;
        tasks.push(tokio::spawn(
            async move {
                let shutdown = pods_drain.signaled();
                tokio::pin!(shutdown);
                loop {
                    tokio::select! {
                        _ = &mut shutdown => return,
                        ev = pods.recv() => match ev {
                            Some(ev) => ctl.handle_pod(ev).await,
                            None => return,
                        },
                    }
                }
            }
            .instrument(info_span!("policycontroller", kind = "pods")),
        ));

        tasks.push(tokio::spawn(
            async move {
                let shutdown = drain.signaled();
                tokio::pin!(shutdown);
                loop {
                    let key = tokio::select! {
                        _ = &mut shutdown => {
                            info!("Stopping");
                            return;
                        }
                        key = self.inner.queue.next() => key,
                    };
                    self.process(key).await;
                }
            }
            .instrument(info_span!("policycontroller")),
        ));
        tasks
    }

    fn watch<K, F>(
        &self,
        kind: &'static str,
        mut events: mpsc::Receiver<WatchEvent<K>>,
        drain: drain::Watch,
        handle: F,
    ) -> JoinHandle<()>
    where
        K: Send + 'static,
        F: Fn(&Controller, WatchEvent<K>) + Send + 'static,
    {
        let ctl = self.clone();
        tokio::spawn(
            async move {
                let shutdown = drain.signaled();
                tokio::pin!(shutdown);
                loop {
                    tokio::select! {
                        _ = &mut shutdown => return,
                        ev = events.recv() => match ev {
                            Some(ev) => handle(&ctl, ev),
                            None => {
                                debug!("Event queue closed");
                                return;
                            }
                        },
                    }
                }
            }
            .instrument(info_span!("policycontroller", kind)),
        )
    }

    /// Reconciles one access object, requeuing it after a delay on failure.
    pub async fn process(&self, key: ObjectKey) {
        let (ns, name) = (&key.0, &key.1);
        let outcome = match self.reconcile(ns, name).await {
            Ok(()) => "ok",
            Err(error) => {
                warn!(%ns, %name, %error, "Failed to reconcile serviceaccountaccess");
                self.inner.queue.add_after(key.clone(), REQUEUE_DELAY);
                "error"
            }
        };
        if let Some(metrics) = &self.inner.metrics {
            metrics.record(outcome);
        }
    }

    pub async fn reconcile(&self, ns: &str, name: &str) -> Result<(), ReconcileError> {
        let acc = match self
            .inner
            .store
            .get_typed::<ServiceAccountAccess>(ns, name)
            .await
        {
            Ok(acc) => acc,
            Err(error) if error.is_not_found() => {
                debug!(%ns, %name, "Access removed");
                return Ok(());
            }
            Err(error) => return Err(error.into()),
        };
        if acc.metadata.deletion_timestamp.is_some() {
            return Ok(());
        }

        let sa_name = acc.service_account_name();
        let sa = self
            .inner
            .listers
            .service_accounts
            .get(ns, &sa_name)
            .filter(|sa| sa.metadata.deletion_timestamp.is_none());
        let Some(sa) = sa else {
            info!(%ns, serviceaccount = %sa_name, "Service account removed; deleting access");
            let nodes = acc.node_list().to_vec();
            self.delete(&acc).await?;
            for node in nodes {
                self.send(&acc, &node, Operation::Delete).await;
            }
            return Ok(());
        };

        let user = ServiceAccountUser::new(ns, sa_name.as_str());
        let closure = self.inner.listers.rbac.closure(&user, ns)?;
        let desired = AccessSpec {
            service_account_uid: sa.metadata.uid.clone().unwrap_or_default(),
            service_account: sa,
            access_role_bindings: closure.role_bindings,
            access_cluster_role_bindings: closure.cluster_role_bindings,
        };
        let nodes = self.node_set(ns, &sa_name);
        let plan = plan(&acc, desired, nodes);
        if plan == Plan::default() {
            debug!(%ns, %name, "Access is up to date");
            return Ok(());
        }
        self.apply(acc, plan).await
    }

    async fn apply(&self, mut acc: ServiceAccountAccess, plan: Plan) -> Result<(), ReconcileError> {
        let ns = acc.namespace().unwrap_or_default();
        if plan.delete {
            info!(%ns, name = %acc.name_any(), "No edge node runs the service account; deleting access");
            self.delete(&acc).await?;
        } else {
            if let Some(spec) = plan.spec {
                acc.spec = spec;
                acc = self.inner.store.replace_typed(&ns, &acc).await?;
            }
            if let Some(nodes) = plan.nodes {
                debug!(%ns, name = %acc.name_any(), ?nodes, "Updating node list");
                acc.status = Some(AccessStatus { node_list: nodes });
                acc = self.inner.store.replace_status_typed(&ns, &acc).await?;
            }
        }
        for (node, op) in plan.sends {
            self.send(&acc, &node, op).await;
        }
        Ok(())
    }

    async fn delete(&self, acc: &ServiceAccountAccess) -> Result<(), StoreError> {
        let ns = acc.namespace().unwrap_or_default();
        match self
            .inner
            .store
            .delete_typed::<ServiceAccountAccess>(&ns, &acc.name_any(), &DeleteParams::default())
            .await
        {
            Err(error) if !error.is_not_found() => Err(error),
            _ => Ok(()),
        }
    }

    /// Edge nodes running a pod in `ns` that uses the service account, sorted.
    pub fn node_set(&self, ns: &str, service_account: &str) -> Vec<String> {
        let mut nodes = self
            .inner
            .listers
            .pods
            .list_namespace(ns)
            .into_iter()
            .filter_map(|pod| {
                let spec = pod.spec?;
                (spec.service_account_name.as_deref() == Some(service_account))
                    .then_some(spec.node_name)
                    .flatten()
            })
            .filter(|node| !node.is_empty() && self.inner.locations.is_edge_node(node))
            .collect::<Vec<_>>();
        nodes.sort();
        nodes.dedup();
        nodes
    }

    /// Sends the access, without its node list, to one node.
    async fn send(&self, acc: &ServiceAccountAccess, node: &str, op: Operation) {
        let ns = acc.namespace().unwrap_or_default();
        let res = match resource::build_resource(
            node,
            resource::namespace_or_null(Some(ns.as_str())),
            resource::SERVICE_ACCOUNT_ACCESS,
            &acc.name_any(),
        ) {
            Ok(res) => res,
            Err(error) => {
                warn!(%node, %error, "Failed to build message resource");
                return;
            }
        };
        let mut body = acc.clone();
        body.status = Some(AccessStatus::default());
        let msg = Message::new("")
            .build_router(modules::POLICY_CONTROLLER, modules::GROUP_RESOURCE, res, op)
            .with_resource_version(acc.resource_version().unwrap_or_default())
            .fill_body(&body);
        let resource = msg.resource().to_string();
        match self.inner.messages.send(msg).await {
            Ok(()) => debug!(%op, %resource, "Sent message"),
            Err(error) => warn!(%op, %resource, %error, "Failed to send message"),
        }
    }

    /// Keys of the access objects tracking `sa`.
    pub fn keys_for_service_account(&self, sa: &ServiceAccount) -> Vec<ObjectKey> {
        let ns = sa.namespace().unwrap_or_default();
        let name = sa.name_any();
        self.inner
            .listers
            .accesses
            .list_namespace(&ns)
            .into_iter()
            .filter(|acc| acc.service_account_name() == name)
            .map(|acc| acc.key())
            .collect()
    }

    fn enqueue_affected(&self, affects: impl Fn(&Rbac, &ServiceAccountUser) -> bool) {
        for acc in self.inner.listers.accesses.list() {
            let user = ServiceAccountUser::new(
                acc.namespace().unwrap_or_default(),
                acc.service_account_name(),
            );
            if affects(&self.inner.listers.rbac, &user) {
                debug!(%user, "RBAC change affects service account");
                self.inner.queue.add(acc.key());
            }
        }
    }

    /// Pods only matter when they run on an edge node under a service account. Creations and
    /// deletions reconcile the access tracking the account; an account without one gets one
    /// created. Other pod updates are ignored.
    pub async fn handle_pod(&self, ev: WatchEvent<Pod>) {
        let WatchEvent { event_type, object: pod } = ev;
        let Some(spec) = pod.spec.as_ref() else {
            return;
        };
        let sa = spec.service_account_name.clone().unwrap_or_default();
        let node = spec.node_name.clone().unwrap_or_default();
        if sa.is_empty() || node.is_empty() || !self.inner.locations.is_edge_node(&node) {
            return;
        }

        let ns = pod.namespace().unwrap_or_default();
        let deleting = event_type == EventType::Deleted || pod.metadata.deletion_timestamp.is_some();
        let tracked = self
            .inner
            .listers
            .accesses
            .list_namespace(&ns)
            .into_iter()
            .find(|acc| acc.service_account_name() == sa);
        match tracked {
            Some(acc) if event_type == EventType::Added || deleting => {
                debug!(%ns, pod = %pod.name_any(), ?event_type, "Pod changes access");
                self.inner.queue.add(acc.key());
            }
            Some(_) => {}
            None if deleting => {}
            None => {
                let acc = new_access(&ns, &sa);
                info!(%ns, serviceaccount = %sa, pod = %pod.name_any(), "Creating serviceaccountaccess");
                match self.inner.store.create_typed(&ns, &acc).await {
                    Ok(_) => {}
                    Err(error) if error.is_already_exists() => {}
                    Err(error) => warn!(%ns, serviceaccount = %sa, %error, "Failed to create serviceaccountaccess"),
                }
            }
        }
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("listers", &self.inner.listers)
            .field("queue", &self.inner.queue.len())
            .finish()
    }
}

/// An access object for a service account, named after it.
fn new_access(ns: &str, sa: &str) -> ServiceAccountAccess {
    let mut acc = ServiceAccountAccess::new(
        sa,
        AccessSpec {
            service_account: ServiceAccount {
                metadata: ObjectMeta {
                    namespace: Some(ns.to_string()),
                    name: Some(sa.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        },
    );
    acc.metadata.namespace = Some(ns.to_string());
    acc
}

trait AccessExt {
    fn key(&self) -> ObjectKey;
    fn service_account_name(&self) -> String;
}

impl AccessExt for ServiceAccountAccess {
    fn key(&self) -> ObjectKey {
        (self.namespace().unwrap_or_default(), self.name_any())
    }

    fn service_account_name(&self) -> String {
        self.spec
            .service_account
            .metadata
            .name
            .clone()
            .unwrap_or_else(|| self.name_any())
    }
}

// === impl ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let reconciles = Family::<ReconcileLabels, Counter>::default();
        reg.register(
            "reconciles",
            "Total number of serviceaccountaccess reconciles by outcome",
            reconciles.clone(),
        );
        Self { reconciles }
    }

    fn record(&self, outcome: &'static str) {
        self.reconciles
            .get_or_create(&ReconcileLabels { outcome })
            .inc();
    }
}
