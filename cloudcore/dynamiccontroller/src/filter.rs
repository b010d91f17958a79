//! Per-node rewriting of objects sent to edge nodes.
//!
//! Filters run in registration order on every object returned by a list or get, and on every
//! watch event, after the object has been copied for the target node.

mod default_master;
mod endpoint_resource;

pub use self::{default_master::DefaultMaster, endpoint_resource::EndpointResource};
use cloudcore_k8s_api::{DynamicObject, Node, Service};
use cloudcore_k8s_index::Lister;
use kube::api::ObjectList;
use std::sync::{Arc, OnceLock};
use tracing::trace;

static FILTERS: OnceLock<Filters> = OnceLock::new();

pub trait Filter: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Returns true if the filter applies to `obj`.
    fn need_filter(&self, obj: &DynamicObject) -> bool;

    /// Rewrites `obj` for `target_node`.
    fn filter_resource(&self, target_node: &str, obj: &mut DynamicObject);
}

/// An ordered chain of uniquely-named filters.
#[derive(Clone, Default)]
pub struct Filters(Arc<Vec<Arc<dyn Filter>>>);

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    #[error("filter {0} is already registered")]
    Duplicate(&'static str),

    #[error("filters are already initialized")]
    AlreadyInitialized,
}

// === impl Filters ===

impl Filters {
    /// The chain installed in every cloud core: endpoint topology filtering, then rewriting of
    /// the default `kubernetes` endpoints to the node-local meta server.
    pub fn defaults(
        services: Lister<Service>,
        nodes: Lister<Node>,
        meta_server_port: u16,
    ) -> Result<Self, FilterError> {
        Self::default()
            .with(EndpointResource::new(services, nodes))?
            .with(DefaultMaster::new(meta_server_port))
    }

    /// Appends a filter to the chain.
    pub fn with(self, filter: impl Filter) -> Result<Self, FilterError> {
        let name = filter.name();
        if self.0.iter().any(|f| f.name() == name) {
            return Err(FilterError::Duplicate(name));
        }
        let mut filters = (*self.0).clone();
        filters.push(Arc::new(filter));
        Ok(Self(Arc::new(filters)))
    }

    /// Freezes the process-wide chain. May only be called once.
    pub fn init(self) -> Result<&'static Filters, FilterError> {
        FILTERS
            .set(self)
            .map_err(|_| FilterError::AlreadyInitialized)?;
        FILTERS.get().ok_or(FilterError::AlreadyInitialized)
    }

    pub fn get() -> Option<&'static Filters> {
        FILTERS.get()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.0.iter().map(|f| f.name()).collect()
    }

    pub fn apply(&self, target_node: &str, obj: &mut DynamicObject) {
        for filter in self.0.iter() {
            if filter.need_filter(obj) {
                trace!(filter = filter.name(), node = %target_node, "Filtering");
                filter.filter_resource(target_node, obj);
            }
        }
    }

    pub fn apply_list(&self, target_node: &str, list: &mut ObjectList<DynamicObject>) {
        for obj in &mut list.items {
            self.apply(target_node, obj);
        }
    }
}

impl std::fmt::Debug for Filters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Filters").field(&self.names()).finish()
    }
}

/// Returns the object's kind, if it is typed.
fn kind_of(obj: &DynamicObject) -> Option<&str> {
    obj.types.as_ref().map(|t| t.kind.as_str())
}
