#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use cloudcore_core as core;
pub use cloudcore_dynamiccontroller as dynamic;
pub use cloudcore_edgecontroller as edge;
pub use cloudcore_k8s_api as k8s;
pub use cloudcore_k8s_index as index;
pub use cloudcore_policycontroller as policy;

mod args;
pub mod tunnel;

pub use self::args::Args;
