//! The edge controller
//!
//! Keeps edge nodes in sync with the cluster: the downstream half pushes the pods, configmaps,
//! secrets, nodes and rules each node needs, and the upstream half applies what nodes report back.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod downstream;
pub mod upstream;

pub use self::{
    downstream::{Downstream, Events},
    upstream::{Listers, Queue, Upstream, UpstreamError, UpstreamMetrics},
};
