//! Lazily-created informers for arbitrary group/version/resource triples.

use crate::informer::Informer;
use ahash::AHashMap as HashMap;
use anyhow::{anyhow, Context, Result};
use cloudcore_core::Gvr;
use cloudcore_k8s_api::{ApiResource, DynamicObject, Watch};
use futures::prelude::*;
use kube::{
    api::Api,
    core::{GroupVersion, TypeMeta},
    runtime::{watcher, WatchStreamExt},
    Client,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, info_span, Instrument};

/// An informer for a dynamically-resolved resource, along with the resource's type information.
#[derive(Clone, Debug)]
pub struct DynamicInformer {
    pub informer: Informer<DynamicObject>,
    pub resource: ApiResource,
}

/// Resolves informers by resource.
#[async_trait::async_trait]
pub trait InformerSource: Send + Sync + 'static {
    /// Returns the shared informer for `gvr`, creating it and waiting for its initial sync if
    /// necessary.
    async fn informer(&self, gvr: &Gvr) -> Result<DynamicInformer>;
}

/// Starts one watch per resource against the API server and shares the resulting informers.
#[derive(Clone)]
pub struct DynamicInformers {
    client: Client,
    drain: drain::Watch,
    informers: Arc<Mutex<HashMap<Gvr, DynamicInformer>>>,
}

// === impl DynamicInformers ===

impl DynamicInformers {
    pub fn new(client: Client, drain: drain::Watch) -> Self {
        Self {
            client,
            drain,
            informers: Default::default(),
        }
    }

    async fn resolve(&self, gvr: &Gvr) -> Result<ApiResource> {
        let gv = GroupVersion::gv(&gvr.group, &gvr.version);
        let group = kube::discovery::oneshot::pinned_group(&self.client, &gv)
            .await
            .with_context(|| format!("failed to discover {}", gvr.api_version()))?;
        group
            .versioned_resources(&gvr.version)
            .into_iter()
            .map(|(ar, _)| ar)
            .find(|ar| ar.plural == gvr.resource)
            .ok_or_else(|| anyhow!("resource {gvr} not found"))
    }

    fn spawn(&self, gvr: &Gvr, resource: ApiResource) -> DynamicInformer {
        let informer = Informer::<DynamicObject>::with_dyntype(resource.clone());
        let api = Api::<DynamicObject>::all_with(self.client.clone(), &resource);
        let types = TypeMeta {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
        };
        let span = info_span!("informer", resource = %gvr);
        let events = Watch::from(
            watcher(api, watcher::Config::default())
                .default_backoff()
                .map_ok(move |ev| {
                    // Objects in list responses omit their type.
                    ev.modify(|obj| obj.types = Some(types.clone()))
                }),
        )
        .instrument(span.clone())
        .into_events();

        let drain = self.drain.clone();
        let run = informer.clone().run(events);
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = run => {}
                    _ = drain.signaled() => info!("Stopped"),
                }
            }
            .instrument(span),
        );

        DynamicInformer { informer, resource }
    }
}

#[async_trait::async_trait]
impl InformerSource for DynamicInformers {
    async fn informer(&self, gvr: &Gvr) -> Result<DynamicInformer> {
        let existing = self.informers.lock().get(gvr).cloned();
        let di = match existing {
            Some(di) => di,
            None => {
                let resource = self.resolve(gvr).await?;
                let mut informers = self.informers.lock();
                // Another caller may have raced us through discovery.
                match informers.get(gvr) {
                    Some(di) => di.clone(),
                    None => {
                        let di = self.spawn(gvr, resource);
                        informers.insert(gvr.clone(), di.clone());
                        di
                    }
                }
            }
        };
        di.informer.wait_for_sync().await;
        Ok(di)
    }
}

impl std::fmt::Debug for DynamicInformers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicInformers")
            .field("informers", &self.informers.lock().len())
            .finish()
    }
}
