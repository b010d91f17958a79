use ahash::AHashMap as HashMap;
use cloudcore_core::Gvr;
use cloudcore_k8s_api::{labels, ApiResource, DynamicObject, Event, ObjectMeta, Pod};
use cloudcore_k8s_index::{DynamicInformer, Informer, InformerSource};
use futures::channel::mpsc;
use kube::core::TypeMeta;
use parking_lot::Mutex;
use std::sync::Arc;

/// Informers fed by tests instead of the API server.
#[derive(Clone, Default)]
pub struct FakeInformers {
    informers: Arc<Mutex<HashMap<Gvr, DynamicInformer>>>,
}

pub fn pods_gvr() -> Gvr {
    Gvr::new("", "v1", "pods")
}

pub fn pods_resource() -> ApiResource {
    ApiResource::erase::<Pod>(&())
}

pub fn mk_pod(ns: &str, name: &str, node: &str, labels: labels::Map) -> DynamicObject {
    DynamicObject {
        types: Some(TypeMeta {
            api_version: "v1".to_string(),
            kind: "Pod".to_string(),
        }),
        metadata: ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            labels: Some(labels),
            resource_version: Some("5".to_string()),
            ..Default::default()
        },
        data: serde_json::json!({ "spec": { "nodeName": node } }),
    }
}

pub fn set_rv(obj: &mut DynamicObject, rv: u64) {
    obj.metadata.resource_version = Some(rv.to_string());
}

// === impl FakeInformers ===

impl FakeInformers {
    /// Starts an informer for `gvr` with `objects` as its initial listing. Further events may be
    /// sent on the returned channel.
    pub fn add(
        &self,
        gvr: Gvr,
        resource: ApiResource,
        objects: Vec<DynamicObject>,
    ) -> mpsc::UnboundedSender<Event<DynamicObject>> {
        let (tx, rx) = mpsc::unbounded();
        let informer = Informer::<DynamicObject>::with_dyntype(resource.clone());
        tokio::spawn(informer.clone().run(rx));

        let _ = tx.unbounded_send(Event::Init);
        for obj in objects {
            let _ = tx.unbounded_send(Event::InitApply(obj));
        }
        let _ = tx.unbounded_send(Event::InitDone);

        self.informers
            .lock()
            .insert(gvr, DynamicInformer { informer, resource });
        tx
    }
}

#[async_trait::async_trait]
impl InformerSource for FakeInformers {
    async fn informer(&self, gvr: &Gvr) -> anyhow::Result<DynamicInformer> {
        let di = self
            .informers
            .lock()
            .get(gvr)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("resource {gvr} not found"))?;
        di.informer.wait_for_sync().await;
        Ok(di)
    }
}
