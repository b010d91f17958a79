use super::{DynamicStore, StoreError};
use ahash::AHashMap as HashMap;
use cloudcore_core::Gvr;
use cloudcore_k8s_api::{labels, ApiResource, DynamicObject, Resource};
use k8s_openapi::{
    api::authorization::v1::SubjectAccessReview, apimachinery::pkg::apis::meta::v1::ListMeta,
};
use kube::{
    api::{DeleteParams, ListParams, ObjectList, Patch, PatchParams},
    core::TypeMeta,
};
use parking_lot::Mutex;
use std::{collections::BTreeMap, str::FromStr, sync::Arc};

/// An in-memory [`DynamicStore`] for tests.
///
/// Every write bumps a store-wide resource version. Strategic-merge patches are applied as JSON
/// merge patches.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore(Arc<Mutex<State>>);

#[derive(Debug, Default)]
struct State {
    resources: Vec<ApiResource>,
    objects: BTreeMap<(String, String, String, String), DynamicObject>,
    version: u64,
    allowed: HashMap<String, bool>,
    raw: HashMap<String, Vec<u8>>,
    reviews: Vec<SubjectAccessReview>,
    fail_next: Vec<StoreError>,
}

type ObjKey = (String, String, String, String);

fn key(resource: &ApiResource, namespace: &str, name: &str) -> ObjKey {
    (
        resource.group.clone(),
        resource.plural.clone(),
        namespace.to_string(),
        name.to_string(),
    )
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes a resource discoverable.
    pub fn with_resource(self, resource: ApiResource) -> Self {
        self.0.lock().resources.push(resource);
        self
    }

    pub fn with_typed<K: Resource<DynamicType = ()>>(self) -> Self {
        self.with_resource(ApiResource::erase::<K>(&()))
    }

    /// Sets the review outcome for a user.
    pub fn allow(&self, user: &str, allowed: bool) {
        self.0.lock().allowed.insert(user.to_string(), allowed);
    }

    pub fn set_raw(&self, path: &str, body: impl Into<Vec<u8>>) {
        self.0.lock().raw.insert(path.to_string(), body.into());
    }

    /// Fails the next mutating call with `error`.
    pub fn fail_next(&self, error: StoreError) {
        self.0.lock().fail_next.push(error);
    }

    pub fn reviews(&self) -> Vec<SubjectAccessReview> {
        self.0.lock().reviews.clone()
    }

    /// Stores a typed object, assigning it a resource version.
    pub fn insert<K: Resource<DynamicType = ()> + serde::Serialize>(&self, obj: &K) {
        let resource = ApiResource::erase::<K>(&());
        if let Ok(obj) = super::to_dynamic(obj) {
            let ns = obj.metadata.namespace.clone().unwrap_or_default();
            self.0.lock().put(&resource, &ns, obj);
        }
    }

    pub fn get_object(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Option<DynamicObject> {
        self.0
            .lock()
            .objects
            .get(&key(resource, namespace, name))
            .cloned()
    }

    pub fn get_typed_object<K: super::Typed>(&self, namespace: &str, name: &str) -> Option<K> {
        let obj = self.get_object(&ApiResource::erase::<K>(&()), namespace, name)?;
        super::from_dynamic(obj).ok()
    }

    pub fn len(&self) -> usize {
        self.0.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl State {
    fn put(&mut self, resource: &ApiResource, namespace: &str, mut obj: DynamicObject) -> DynamicObject {
        self.version += 1;
        obj.metadata.resource_version = Some(self.version.to_string());
        if !namespace.is_empty() {
            obj.metadata.namespace = Some(namespace.to_string());
        }
        obj.types = Some(TypeMeta {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
        });
        let name = obj.metadata.name.clone().unwrap_or_default();
        self.objects
            .insert(key(resource, namespace, &name), obj.clone());
        obj
    }

    fn take_failure(&mut self) -> Result<(), StoreError> {
        match self.fail_next.pop() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl DynamicStore for MemoryStore {
    async fn resolve(&self, gvr: &Gvr) -> Result<ApiResource, StoreError> {
        self.0
            .lock()
            .resources
            .iter()
            .find(|ar| ar.group == gvr.group && ar.version == gvr.version && ar.plural == gvr.resource)
            .cloned()
            .ok_or_else(|| StoreError::UnknownResource(gvr.clone()))
    }

    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject, StoreError> {
        self.get_object(resource, namespace, name)
            .ok_or_else(|| StoreError::not_found(&resource.plural, name))
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        params: &ListParams,
    ) -> Result<ObjectList<DynamicObject>, StoreError> {
        let selector = params
            .label_selector
            .as_deref()
            .map(labels::Selector::from_str)
            .transpose()
            .map_err(|e| StoreError::status(400, "BadRequest", e.to_string()))?
            .unwrap_or_default();
        let state = self.0.lock();
        let items = state
            .objects
            .iter()
            .filter(|((g, p, ns, _), _)| {
                *g == resource.group
                    && *p == resource.plural
                    && (namespace.is_empty() || ns == namespace)
            })
            .map(|(_, obj)| obj)
            .filter(|obj| {
                let labels = obj.metadata.labels.clone().unwrap_or_default();
                selector.matches(&labels)
            })
            // List items carry no type, as in API server responses.
            .map(|obj| DynamicObject {
                types: None,
                ..obj.clone()
            })
            .collect();
        Ok(ObjectList {
            types: TypeMeta {
                api_version: resource.api_version.clone(),
                kind: format!("{}List", resource.kind),
            },
            metadata: ListMeta {
                resource_version: Some(state.version.to_string()),
                ..Default::default()
            },
            items,
        })
    }

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        let mut state = self.0.lock();
        state.take_failure()?;
        let name = obj.metadata.name.clone().unwrap_or_default();
        if state.objects.contains_key(&key(resource, namespace, &name)) {
            return Err(StoreError::already_exists(&resource.plural, &name));
        }
        Ok(state.put(resource, namespace, obj.clone()))
    }

    async fn replace(
        &self,
        resource: &ApiResource,
        namespace: &str,
        obj: &DynamicObject,
        _subresource: Option<&str>,
    ) -> Result<DynamicObject, StoreError> {
        let mut state = self.0.lock();
        state.take_failure()?;
        let name = obj.metadata.name.clone().unwrap_or_default();
        let Some(current) = state.objects.get(&key(resource, namespace, &name)) else {
            return Err(StoreError::not_found(&resource.plural, &name));
        };
        if let Some(rv) = obj.metadata.resource_version.as_deref() {
            if current.metadata.resource_version.as_deref() != Some(rv) {
                return Err(StoreError::conflict(
                    &resource.plural,
                    &name,
                    "the object has been modified; please apply your changes to the latest version and try again",
                ));
            }
        }
        Ok(state.put(resource, namespace, obj.clone()))
    }

    async fn patch(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: &Patch<serde_json::Value>,
        _params: &PatchParams,
        _subresource: Option<&str>,
    ) -> Result<DynamicObject, StoreError> {
        let mut state = self.0.lock();
        state.take_failure()?;
        let Some(current) = state.objects.get(&key(resource, namespace, name)) else {
            return Err(StoreError::not_found(&resource.plural, name));
        };
        let patch = match patch {
            Patch::Merge(p) | Patch::Strategic(p) | Patch::Apply(p) => p,
            _ => return Err(StoreError::status(415, "UnsupportedMediaType", "unsupported patch")),
        };
        let mut value = serde_json::to_value(current).map_err(|source| StoreError::Decode {
            kind: resource.kind.clone(),
            source,
        })?;
        merge(&mut value, patch);
        let obj = serde_json::from_value(value).map_err(|source| StoreError::Decode {
            kind: resource.kind.clone(),
            source,
        })?;
        Ok(state.put(resource, namespace, obj))
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        params: &DeleteParams,
    ) -> Result<(), StoreError> {
        let mut state = self.0.lock();
        state.take_failure()?;
        let k = key(resource, namespace, name);
        let Some(current) = state.objects.get(&k) else {
            return Err(StoreError::not_found(&resource.plural, name));
        };
        if let Some(uid) = params.preconditions.as_ref().and_then(|p| p.uid.as_deref()) {
            if current.metadata.uid.as_deref() != Some(uid) {
                return Err(StoreError::conflict(
                    &resource.plural,
                    name,
                    "Precondition failed: UID in precondition does not match UID in object, the object might have been deleted and then recreated",
                ));
            }
        }
        state.objects.remove(&k);
        state.version += 1;
        Ok(())
    }

    async fn create_subresource(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        subresource: &str,
        mut body: serde_json::Value,
    ) -> Result<serde_json::Value, StoreError> {
        let mut state = self.0.lock();
        state.take_failure()?;
        if !state.objects.contains_key(&key(resource, namespace, name)) {
            return Err(StoreError::not_found(&resource.plural, name));
        }
        if subresource == "token" {
            body["status"] = serde_json::json!({
                "token": format!("token-{namespace}-{name}"),
                "expirationTimestamp": "2030-01-01T00:00:00Z",
            });
        }
        Ok(body)
    }

    async fn review_access(&self, review: SubjectAccessReview) -> Result<bool, StoreError> {
        let mut state = self.0.lock();
        let user = review.spec.user.clone().unwrap_or_default();
        state.reviews.push(review);
        Ok(state.allowed.get(&user).copied().unwrap_or(true))
    }

    async fn raw_get(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        self.0
            .lock()
            .raw
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::not_found("path", path))
    }
}

/// Applies a JSON merge patch.
fn merge(target: &mut serde_json::Value, patch: &serde_json::Value) {
    let serde_json::Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = serde_json::Value::Object(Default::default());
    }
    if let serde_json::Value::Object(map) = target {
        for (k, v) in patch {
            if v.is_null() {
                map.remove(k);
            } else {
                merge(map.entry(k.clone()).or_insert(serde_json::Value::Null), v);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TypedStoreExt;
    use cloudcore_k8s_api::{ConfigMap, ObjectMeta};
    use maplit::btreemap;

    fn mk_cm(name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                namespace: Some("default".to_string()),
                name: Some(name.to_string()),
                labels: Some(btreemap! { "app".to_string() => name.to_string() }),
                ..Default::default()
            },
            data: Some(btreemap! { "k".to_string() => "v".to_string() }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn typed_round_trip() {
        let store = MemoryStore::new().with_typed::<ConfigMap>();
        let created = store.create_typed("default", &mk_cm("a")).await.unwrap();
        assert_eq!(created.metadata.resource_version.as_deref(), Some("1"));

        let got = store.get_typed::<ConfigMap>("default", "a").await.unwrap();
        assert_eq!(got.data, mk_cm("a").data);

        let err = store.create_typed("default", &mk_cm("a")).await.unwrap_err();
        assert!(err.is_already_exists());
        assert!(err.is_conflict());

        let err = store.get_typed::<ConfigMap>("default", "b").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn merge_patches_and_lists() {
        let store = MemoryStore::new().with_typed::<ConfigMap>();
        store.insert(&mk_cm("a"));
        store.insert(&mk_cm("b"));

        let patched = store
            .patch_typed::<ConfigMap>(
                "default",
                "a",
                &Patch::Merge(serde_json::json!({ "data": { "k": null, "x": "y" } })),
                None,
            )
            .await
            .unwrap();
        assert_eq!(
            patched.data,
            Some(btreemap! { "x".to_string() => "y".to_string() })
        );

        let ar = ApiResource::erase::<ConfigMap>(&());
        let list = store
            .list(&ar, "default", &ListParams::default().labels("app=b"))
            .await
            .unwrap();
        assert_eq!(list.items.len(), 1);
        assert_eq!(list.items[0].metadata.name.as_deref(), Some("b"));
        assert!(list.items[0].types.is_none());
    }
}
