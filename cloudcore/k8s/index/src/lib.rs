#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod dynamic;
pub mod informer;
pub mod location;
pub mod store;

pub use self::{
    dynamic::{DynamicInformer, DynamicInformers, InformerSource},
    informer::{object_key, EventType, Informer, Lister, ObjectKey, WatchEvent},
    location::LocationCache,
    store::{DynamicStore, KubeStore, StoreError, TypedStoreExt},
};
