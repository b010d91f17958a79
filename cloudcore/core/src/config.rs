use serde::{Deserialize, Serialize};
use std::{sync::OnceLock, time::Duration};

static CONFIG: OnceLock<Config> = OnceLock::new();

pub const DEFAULT_EDGE_NODE_ROLE_LABEL: &str = "node-role.kubernetes.io/edge";
pub const DEFAULT_SYSTEM_NAMESPACE: &str = "kubeedge";

/// Process-wide configuration, frozen before any controller starts.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub buffer: Buffer,
    pub load: Load,
    /// Seconds after which a node heartbeat reported from the edge is considered stale.
    pub node_update_frequency: u64,
    pub edge_node_role_label: String,
    /// Rejects applications whose message node differs from the application's node.
    pub enable_authorization: bool,
    pub meta_server_port: u16,
    pub tunnel_base_port: u16,
    pub system_namespace: String,
    pub watch_engine: WatchEngine,
    /// `<path>::<verb>` pairs forwarded to the API server without interpretation.
    pub pass_through: Vec<String>,
}

/// Capacities of the upstream queues and downstream event queues.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Buffer {
    pub update_pod_status: usize,
    pub update_node_status: usize,
    pub query_configmap: usize,
    pub query_secret: usize,
    pub patch_pod: usize,
    pub delete_pod: usize,
    pub create_pod: usize,
    pub create_node: usize,
    pub patch_node: usize,
    pub update_node: usize,
    pub query_node: usize,
    pub create_lease: usize,
    pub query_lease: usize,
    pub create_csr: usize,
    pub query_csr: usize,
    pub service_account_token: usize,
    pub query_persistent_volume: usize,
    pub query_persistent_volume_claim: usize,
    pub query_volume_attachment: usize,
    pub update_rule_status: usize,

    pub pod_event: usize,
    pub configmap_event: usize,
    pub secret_event: usize,
    pub node_event: usize,
    pub rule_event: usize,
    pub rule_endpoint_event: usize,
    pub service_account_access_event: usize,
}

/// Worker counts for the upstream pools.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Load {
    pub update_pod_status_workers: usize,
    pub update_node_status_workers: usize,
    pub query_configmap_workers: usize,
    pub query_secret_workers: usize,
    pub patch_pod_workers: usize,
    pub delete_pod_workers: usize,
    pub create_pod_workers: usize,
    pub create_node_workers: usize,
    pub patch_node_workers: usize,
    pub update_node_workers: usize,
    pub query_node_workers: usize,
    pub create_lease_workers: usize,
    pub query_lease_workers: usize,
    pub create_csr_workers: usize,
    pub query_csr_workers: usize,
    pub service_account_token_workers: usize,
    pub query_persistent_volume_workers: usize,
    pub query_persistent_volume_claim_workers: usize,
    pub query_volume_attachment_workers: usize,
    pub update_rule_status_workers: usize,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchEngine {
    /// Listeners are fed directly from the informer.
    #[default]
    Simple,
    /// Events are recorded in a sliding-window cache so watchers may resume from a version.
    Cacher,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("configuration is already initialized")]
    AlreadyInitialized,
}

// === impl Config ===

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Freezes the process configuration. May only be called once.
    pub fn init(self) -> Result<&'static Config, ConfigError> {
        CONFIG
            .set(self)
            .map_err(|_| ConfigError::AlreadyInitialized)?;
        CONFIG.get().ok_or(ConfigError::AlreadyInitialized)
    }

    /// Returns the frozen process configuration, if it has been initialized.
    pub fn get() -> Option<&'static Config> {
        CONFIG.get()
    }

    pub fn node_update_frequency(&self) -> Duration {
        Duration::from_secs(self.node_update_frequency)
    }

    /// Capacity of each per-resource event queue in the dynamic controller.
    pub fn handler_buffer(&self) -> usize {
        match self.watch_engine {
            WatchEngine::Simple => 100,
            WatchEngine::Cacher => 1024,
        }
    }

    pub fn is_pass_through(&self, path: &str, verb: &str) -> bool {
        self.pass_through.iter().any(|entry| {
            entry
                .split_once("::")
                .map(|(p, v)| p == path && v == verb)
                .unwrap_or(false)
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer: Buffer::default(),
            load: Load::default(),
            node_update_frequency: 10,
            edge_node_role_label: DEFAULT_EDGE_NODE_ROLE_LABEL.to_string(),
            enable_authorization: false,
            meta_server_port: 10550,
            tunnel_base_port: 10350,
            system_namespace: DEFAULT_SYSTEM_NAMESPACE.to_string(),
            watch_engine: WatchEngine::default(),
            pass_through: vec!["/version::get".to_string()],
        }
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self {
            update_pod_status: 1024,
            update_node_status: 1024,
            query_configmap: 1024,
            query_secret: 1024,
            patch_pod: 1024,
            delete_pod: 1024,
            create_pod: 1024,
            create_node: 1024,
            patch_node: 1024,
            update_node: 1024,
            query_node: 1024,
            create_lease: 1024,
            query_lease: 1024,
            create_csr: 1024,
            query_csr: 1024,
            service_account_token: 1024,
            query_persistent_volume: 1024,
            query_persistent_volume_claim: 1024,
            query_volume_attachment: 1024,
            update_rule_status: 1024,

            pod_event: 1,
            configmap_event: 1,
            secret_event: 1,
            node_event: 1,
            rule_event: 1,
            rule_endpoint_event: 1,
            service_account_access_event: 1,
        }
    }
}

impl Default for Load {
    fn default() -> Self {
        Self {
            update_pod_status_workers: 1,
            update_node_status_workers: 1,
            query_configmap_workers: 4,
            query_secret_workers: 4,
            patch_pod_workers: 100,
            delete_pod_workers: 100,
            create_pod_workers: 4,
            create_node_workers: 100,
            patch_node_workers: 100,
            update_node_workers: 4,
            query_node_workers: 4,
            create_lease_workers: 4,
            query_lease_workers: 4,
            create_csr_workers: 4,
            query_csr_workers: 4,
            service_account_token_workers: 4,
            query_persistent_volume_workers: 4,
            query_persistent_volume_claim_workers: 4,
            query_volume_attachment_workers: 4,
            update_rule_status_workers: 4,
        }
    }
}
