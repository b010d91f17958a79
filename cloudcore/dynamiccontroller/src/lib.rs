//! Serves resource operations that edge nodes request through `Application` envelopes.
//!
//! Single-shot verbs are re-executed against the API server. Watches become listeners: each
//! listener is fed by a per-resource event handler and pushes matching changes to its node until
//! the node stops declaring it.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod cache;
pub mod center;
pub mod filter;
pub mod handler;
pub mod listener;
mod options;

#[cfg(test)]
mod test_util;

pub use self::{
    cache::{CacheWatcher, WatchCache, WatchCacheError},
    center::{Center, CenterError, CenterMetrics},
    filter::{Filter, Filters},
    handler::{HandlerCenter, HandlerError},
    listener::{ListenerIndex, SelectorListener},
    options::ListOptions,
};
