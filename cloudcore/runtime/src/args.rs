use crate::{
    core::{modules, Bus, BusMetrics, Config, Inbox, MessageLayer},
    dynamic::{CenterMetrics, Filters, HandlerCenter, ListenerIndex},
    edge::UpstreamMetrics,
    index::{DynamicInformers, DynamicStore, Informer, KubeStore, LocationCache},
    k8s::{
        self,
        policy::ServiceAccountAccess,
        rules::{Rule, RuleEndpoint},
        Resource,
    },
    policy::ControllerMetrics,
    tunnel,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::{future::BoxFuture, prelude::*};
use kube::{runtime::watcher, Client};
use prometheus_client::registry::Registry;
use serde::de::DeserializeOwned;
use std::{net::IpAddr, path::PathBuf, sync::Arc};
use tokio::{task::JoinHandle, time::Duration};
use tracing::{debug, info, info_span, warn, Instrument};

/// Capacity of each module's inbox on the bus.
const MODULE_QUEUE_CAPACITY: usize = 1024;

const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Parser)]
#[clap(name = "cloudcore", about = "Synchronizes edge nodes with the cluster")]
pub struct Args {
    #[clap(long, default_value = "cloudcore=info,warn", env = "CLOUDCORE_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// A YAML file overriding the default configuration.
    #[clap(long, env = "CLOUDCORE_CONFIG")]
    config: Option<PathBuf>,

    /// The address this replica registers its tunnel port under. Defaults to an address of the
    /// host name.
    #[clap(long, env = "CLOUDCORE_ADVERTISE_ADDRESS")]
    advertise_address: Option<IpAddr>,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            config,
            advertise_address,
        } = self;

        let config = load_config(config.as_deref()).await?;
        let config = config.init()?.clone();

        let mut prom = <Registry>::default();
        let bus_metrics = BusMetrics::register(prom.sub_registry_with_prefix("bus"));
        let upstream_metrics =
            UpstreamMetrics::register(prom.sub_registry_with_prefix("upstream"));
        let center_metrics =
            CenterMetrics::register(prom.sub_registry_with_prefix("application_center"));
        let policy_metrics =
            ControllerMetrics::register(prom.sub_registry_with_prefix("policy_controller"));
        let locations = LocationCache::default();
        locations.register_metrics(prom.sub_registry_with_prefix("location_cache"));
        let listeners = ListenerIndex::default();
        listeners.register_metrics(prom.sub_registry_with_prefix("dynamic_controller"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let client = runtime.client();
        let store: Arc<dyn DynamicStore> = Arc::new(KubeStore::new(client.clone()));

        let ip = tunnel::local_ip(advertise_address).await?;
        let tunnel_port = tunnel::negotiate(
            store.as_ref(),
            &config.system_namespace,
            ip,
            config.tunnel_base_port,
        )
        .await
        .context("failed to negotiate the tunnel port")?;
        info!(%ip, tunnel_port, "Negotiated tunnel port");

        let bus = Bus::new(bus_metrics);
        let mut inboxes = Vec::with_capacity(modules::ALL.len());
        for (name, group) in modules::ALL {
            inboxes.push(bus.register(*name, *group, MODULE_QUEUE_CAPACITY)?);
        }
        let mut take_inbox = |name: &str| {
            let idx = inboxes.iter().position(|i| i.name() == name)?;
            Some(inboxes.swap_remove(idx))
        };
        let edge_inbox = take_inbox(modules::EDGE_CONTROLLER).context("edge controller inbox")?;
        let dynamic_inbox =
            take_inbox(modules::DYNAMIC_CONTROLLER).context("dynamic controller inbox")?;

        // Spawn resource watches once every handler is attached.

        let mut watches = Vec::new();
        let buffer = &config.buffer;

        let pods = watch::<k8s::Pod, _>(&mut runtime, &mut watches, "pods");
        let configmaps = watch::<k8s::ConfigMap, _>(&mut runtime, &mut watches, "configmaps");
        let secrets = watch::<k8s::Secret, _>(&mut runtime, &mut watches, "secrets");
        let nodes = watch::<k8s::Node, _>(&mut runtime, &mut watches, "nodes");
        let services = watch::<k8s::Service, _>(&mut runtime, &mut watches, "services");

        let rules = Informer::<Rule>::new();
        let rule_endpoints = Informer::<RuleEndpoint>::new();
        if api_resource_exists::<Rule>(&client).await {
            watch_into(&rules, &mut runtime, &mut watches, "rules");
            watch_into(&rule_endpoints, &mut runtime, &mut watches, "ruleendpoints");
        } else {
            warn!("rules.rules.kubeedge.io resource kind not found, skipping watches");
        }

        let downstream_events = crate::edge::Events {
            pods: pods.add_handler(buffer.pod_event),
            configmaps: configmaps.add_handler(buffer.configmap_event),
            secrets: secrets.add_handler(buffer.secret_event),
            nodes: nodes.add_handler(buffer.node_event),
            rules: rules.add_handler(buffer.rule_event),
            rule_endpoints: rule_endpoints.add_handler(buffer.rule_endpoint_event),
        };

        let policy = if api_resource_exists::<ServiceAccountAccess>(&client).await {
            let accesses = watch::<ServiceAccountAccess, _>(
                &mut runtime,
                &mut watches,
                "serviceaccountaccesses",
            );
            let service_accounts =
                watch::<k8s::ServiceAccount, _>(&mut runtime, &mut watches, "serviceaccounts");
            let roles = watch::<k8s::Role, _>(&mut runtime, &mut watches, "roles");
            let cluster_roles =
                watch::<k8s::ClusterRole, _>(&mut runtime, &mut watches, "clusterroles");
            let role_bindings =
                watch::<k8s::RoleBinding, _>(&mut runtime, &mut watches, "rolebindings");
            let cluster_role_bindings = watch::<k8s::ClusterRoleBinding, _>(
                &mut runtime,
                &mut watches,
                "clusterrolebindings",
            );
            let capacity = buffer.service_account_access_event;
            let events = crate::policy::Events {
                accesses: accesses.add_handler(capacity),
                service_accounts: service_accounts.add_handler(capacity),
                pods: pods.add_handler(buffer.pod_event),
                roles: roles.add_handler(capacity),
                cluster_roles: cluster_roles.add_handler(capacity),
                role_bindings: role_bindings.add_handler(capacity),
                cluster_role_bindings: cluster_role_bindings.add_handler(capacity),
            };
            let listers = crate::policy::Listers {
                accesses: accesses.lister(),
                service_accounts: service_accounts.lister(),
                pods: pods.lister(),
                rbac: crate::policy::Rbac {
                    roles: roles.lister(),
                    cluster_roles: cluster_roles.lister(),
                    role_bindings: role_bindings.lister(),
                    cluster_role_bindings: cluster_role_bindings.lister(),
                },
            };
            Some((events, listers))
        } else {
            warn!("serviceaccountaccesses.policy.kubeedge.io resource kind not found, skipping policy controller");
            None
        };

        // Watches end on their own once the runtime begins shutting down.
        for run in watches {
            tokio::spawn(run);
        }

        tokio::time::timeout(CACHE_SYNC_TIMEOUT, async {
            nodes.wait_for_sync().await;
            pods.wait_for_sync().await;
        })
        .await
        .context("timed out waiting for node and pod caches to sync")?;

        let downstream = crate::edge::Downstream::new(
            MessageLayer::new(bus.clone(), modules::EDGE_CONTROLLER),
            locations.clone(),
            &config.edge_node_role_label,
        );
        downstream.prime(&nodes.lister().list(), &pods.lister().list());
        downstream.spawn(downstream_events, runtime.shutdown_handle());

        let upstream = crate::edge::Upstream::new(
            store.clone(),
            MessageLayer::new(bus.clone(), modules::EDGE_CONTROLLER),
            config.clone(),
            tunnel_port,
        )
        .with_listers(crate::edge::Listers {
            configmaps: Some(configmaps.lister()),
            secrets: Some(secrets.lister()),
            nodes: Some(nodes.lister()),
        })
        .with_metrics(upstream_metrics);
        upstream.spawn(edge_inbox, runtime.shutdown_handle());

        let filters = Filters::defaults(services.lister(), nodes.lister(), config.meta_server_port)?
            .init()?
            .clone();
        info!(filters = ?filters.names(), "Initialized filters");
        let dynamic_messages = MessageLayer::new(bus.clone(), modules::DYNAMIC_CONTROLLER);
        let handlers = HandlerCenter::with_listeners(
            listeners,
            Arc::new(DynamicInformers::new(
                client.clone(),
                runtime.shutdown_handle(),
            )),
            dynamic_messages.clone(),
            filters.clone(),
            &config,
            runtime.shutdown_handle(),
        );
        let center = crate::dynamic::Center::new(
            store.clone(),
            handlers,
            dynamic_messages,
            filters,
            config.clone(),
        )
        .with_metrics(center_metrics);
        center.spawn(dynamic_inbox, runtime.shutdown_handle());

        if let Some((events, listers)) = policy {
            let controller = crate::policy::Controller::new(
                store.clone(),
                MessageLayer::new(bus.clone(), modules::POLICY_CONTROLLER),
                locations.clone(),
                listers,
            )
            .with_metrics(policy_metrics);
            controller.spawn(events, runtime.shutdown_handle());
        }

        // Modules whose transport lives outside this process.
        for inbox in inboxes {
            detached(inbox, runtime.shutdown_handle());
        }

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

async fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let yaml = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    Config::from_yaml(&yaml).with_context(|| format!("failed to load {}", path.display()))
}

/// Creates an informer for `K` and queues its watch; the watch starts once the returned future
/// is spawned.
fn watch<K, S: 'static>(
    runtime: &mut kubert::Runtime<S>,
    watches: &mut Vec<BoxFuture<'static, ()>>,
    name: &'static str,
) -> Informer<K>
where
    K: Resource<DynamicType = ()> + DeserializeOwned + Clone + std::fmt::Debug + Send + Sync,
    K: 'static,
{
    let informer = Informer::new();
    watch_into(&informer, runtime, watches, name);
    informer
}

fn watch_into<K, S: 'static>(
    informer: &Informer<K>,
    runtime: &mut kubert::Runtime<S>,
    watches: &mut Vec<BoxFuture<'static, ()>>,
    name: &'static str,
) where
    K: Resource<DynamicType = ()> + DeserializeOwned + Clone + std::fmt::Debug + Send + Sync,
    K: 'static,
{
    let events = runtime.watch_all::<K>(watcher::Config::default());
    watches.push(
        informer
            .clone()
            .run(events)
            .instrument(info_span!("informer", resource = name))
            .boxed(),
    );
}

/// Discards messages addressed to a module served by an external transport.
fn detached(mut inbox: Inbox, drain: drain::Watch) -> JoinHandle<()> {
    let module = inbox.name().to_string();
    tokio::spawn(
        async move {
            let shutdown = drain.signaled();
            tokio::pin!(shutdown);
            loop {
                tokio::select! {
                    _ = &mut shutdown => return,
                    msg = inbox.recv() => match msg {
                        Some(msg) => debug!(id = %msg.id(), resource = %msg.resource(), "No transport attached"),
                        None => return,
                    },
                }
            }
        }
        .instrument(info_span!("module", %module)),
    )
}

async fn api_resource_exists<T>(client: &Client) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    client
        .list_api_group_resources(&T::api_version(&dt))
        .await
        .ok()
        .iter()
        .flat_map(|r| r.resources.iter())
        .any(|r| r.kind == T::kind(&dt))
}
