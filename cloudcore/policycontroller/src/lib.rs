//! Projects service account permissions onto edge nodes.
//!
//! Each `ServiceAccountAccess` records the RBAC rules a service account can reach and the edge
//! nodes running pods under that account. The controller keeps both current as roles, bindings
//! and pods change, and pushes the access object to exactly the nodes that need it.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod controller;
pub mod plan;
mod queue;
pub mod rbac;

pub use self::{
    controller::{Controller, ControllerMetrics, Events, Listers, ReconcileError},
    queue::WorkQueue,
    rbac::{Rbac, RbacError, ServiceAccountUser},
};
