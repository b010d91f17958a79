//! Access to the API server for arbitrary resources.
//!
//! Controllers talk to the API server through [`DynamicStore`] so that every operation an edge
//! node may request (including subresources and raw GET paths) funnels through one seam. Typed
//! helpers in [`TypedStoreExt`] convert to and from `k8s-openapi` types.

use cloudcore_core::Gvr;
use cloudcore_k8s_api::{ApiResource, DynamicObject, Resource, Status};
use k8s_openapi::{
    api::authorization::v1::SubjectAccessReview,
    apimachinery::pkg::apis::meta::v1::DeleteOptions,
};
use kube::{
    api::{
        Api, DeleteParams, ListParams, ObjectList, Patch, PatchParams, PostParams, Preconditions,
        PropagationPolicy,
    },
    core::{GroupVersion, TypeMeta},
    Client,
};
use serde::{de::DeserializeOwned, Serialize};

#[cfg(any(test, feature = "test-util"))]
mod memory;
#[cfg(any(test, feature = "test-util"))]
pub use self::memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A structural error reported by the API server.
    #[error("{}", .0.message.as_deref().unwrap_or("the server rejected the request"))]
    Api(Box<Status>),

    #[error(transparent)]
    Client(kube::Error),

    #[error("failed to decode {kind}: {source}")]
    Decode {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("the server could not find the requested resource {0}")]
    UnknownResource(Gvr),
}

#[async_trait::async_trait]
pub trait DynamicStore: Send + Sync + 'static {
    /// Resolves a resource's type information through discovery.
    async fn resolve(&self, gvr: &Gvr) -> Result<ApiResource, StoreError>;

    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject, StoreError>;

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        params: &ListParams,
    ) -> Result<ObjectList<DynamicObject>, StoreError>;

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, StoreError>;

    /// Replaces the object, or one of its subresources when `subresource` is set.
    async fn replace(
        &self,
        resource: &ApiResource,
        namespace: &str,
        obj: &DynamicObject,
        subresource: Option<&str>,
    ) -> Result<DynamicObject, StoreError>;

    async fn patch(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: &Patch<serde_json::Value>,
        params: &PatchParams,
        subresource: Option<&str>,
    ) -> Result<DynamicObject, StoreError>;

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        params: &DeleteParams,
    ) -> Result<(), StoreError>;

    /// Posts `body` to a subresource (e.g. `serviceaccounts/<name>/token`).
    async fn create_subresource(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        subresource: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, StoreError>;

    /// Creates the review and returns whether access is allowed.
    async fn review_access(&self, review: SubjectAccessReview) -> Result<bool, StoreError>;

    /// Issues a GET against a raw API path, returning the body untouched.
    async fn raw_get(&self, path: &str) -> Result<Vec<u8>, StoreError>;
}

/// Typed conveniences over a [`DynamicStore`].
#[async_trait::async_trait]
pub trait TypedStoreExt: DynamicStore {
    async fn get_typed<K: Typed>(&self, namespace: &str, name: &str) -> Result<K, StoreError> {
        let obj = self.get(&ApiResource::erase::<K>(&()), namespace, name).await?;
        from_dynamic(obj)
    }

    async fn create_typed<K: Typed>(&self, namespace: &str, obj: &K) -> Result<K, StoreError> {
        let created = self
            .create(&ApiResource::erase::<K>(&()), namespace, &to_dynamic(obj)?)
            .await?;
        from_dynamic(created)
    }

    async fn replace_typed<K: Typed>(&self, namespace: &str, obj: &K) -> Result<K, StoreError> {
        let replaced = self
            .replace(&ApiResource::erase::<K>(&()), namespace, &to_dynamic(obj)?, None)
            .await?;
        from_dynamic(replaced)
    }

    async fn replace_status_typed<K: Typed>(
        &self,
        namespace: &str,
        obj: &K,
    ) -> Result<K, StoreError> {
        let replaced = self
            .replace(
                &ApiResource::erase::<K>(&()),
                namespace,
                &to_dynamic(obj)?,
                Some("status"),
            )
            .await?;
        from_dynamic(replaced)
    }

    async fn patch_typed<K: Typed>(
        &self,
        namespace: &str,
        name: &str,
        patch: &Patch<serde_json::Value>,
        subresource: Option<&str>,
    ) -> Result<K, StoreError> {
        let patched = self
            .patch(
                &ApiResource::erase::<K>(&()),
                namespace,
                name,
                patch,
                &PatchParams::default(),
                subresource,
            )
            .await?;
        from_dynamic(patched)
    }

    async fn delete_typed<K: Typed>(
        &self,
        namespace: &str,
        name: &str,
        params: &DeleteParams,
    ) -> Result<(), StoreError> {
        self.delete(&ApiResource::erase::<K>(&()), namespace, name, params)
            .await
    }
}

impl<S: DynamicStore + ?Sized> TypedStoreExt for S {}

/// Bounds satisfied by every statically-typed resource.
pub trait Typed:
    Resource<DynamicType = ()> + DeserializeOwned + Serialize + Send + Sync + 'static
{
}

impl<K> Typed for K where
    K: Resource<DynamicType = ()> + DeserializeOwned + Serialize + Send + Sync + 'static
{
}

/// A [`DynamicStore`] backed by the API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

/// Sets the object's type from `resource` if the server omitted it, as it does for list items.
pub fn stamp_types(obj: &mut DynamicObject, resource: &ApiResource) {
    if obj.types.is_none() {
        obj.types = Some(TypeMeta {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
        });
    }
}

pub fn to_dynamic<K: Serialize>(obj: &K) -> Result<DynamicObject, StoreError> {
    serde_json::to_value(obj)
        .and_then(serde_json::from_value)
        .map_err(|source| StoreError::Decode {
            kind: std::any::type_name::<K>().to_string(),
            source,
        })
}

pub fn from_dynamic<K: Typed>(obj: DynamicObject) -> Result<K, StoreError> {
    let mut value = serde_json::to_value(obj).map_err(|source| StoreError::Decode {
        kind: K::kind(&()).to_string(),
        source,
    })?;
    // Objects fetched dynamically may omit their type.
    if let Some(map) = value.as_object_mut() {
        map.entry("apiVersion")
            .or_insert_with(|| K::api_version(&()).into());
        map.entry("kind").or_insert_with(|| K::kind(&()).into());
    }
    serde_json::from_value(value).map_err(|source| StoreError::Decode {
        kind: K::kind(&()).to_string(),
        source,
    })
}

/// Converts wire-format delete options into client parameters. Unknown propagation policies are
/// left to the server default.
pub fn delete_params(options: DeleteOptions) -> DeleteParams {
    let propagation_policy = options
        .propagation_policy
        .as_deref()
        .and_then(|p| match p {
            "Orphan" => Some(PropagationPolicy::Orphan),
            "Background" => Some(PropagationPolicy::Background),
            "Foreground" => Some(PropagationPolicy::Foreground),
            _ => None,
        });
    DeleteParams {
        dry_run: options.dry_run.map(|d| !d.is_empty()).unwrap_or(false),
        grace_period_seconds: options
            .grace_period_seconds
            .and_then(|g| u32::try_from(g).ok()),
        propagation_policy,
        preconditions: options.preconditions.map(|p| Preconditions {
            resource_version: p.resource_version,
            uid: p.uid,
        }),
    }
}

// === impl StoreError ===

impl StoreError {
    pub fn status(code: u16, reason: &str, message: impl Into<String>) -> Self {
        Self::Api(Box::new(Status {
            status: Some("Failure".to_string()),
            code: Some(code.into()),
            reason: Some(reason.to_string()),
            message: Some(message.into()),
            ..Default::default()
        }))
    }

    pub fn not_found(resource: &str, name: &str) -> Self {
        Self::status(404, "NotFound", format!("{resource} \"{name}\" not found"))
    }

    pub fn conflict(resource: &str, name: &str, detail: &str) -> Self {
        Self::status(
            409,
            "Conflict",
            format!("Operation cannot be fulfilled on {resource} \"{name}\": {detail}"),
        )
    }

    pub fn already_exists(resource: &str, name: &str) -> Self {
        Self::status(
            409,
            "AlreadyExists",
            format!("{resource} \"{name}\" already exists"),
        )
    }

    /// The error returned when a watch asks for history that is no longer retained.
    pub fn gone(message: impl Into<String>) -> Self {
        Self::status(410, "Expired", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::status(403, "Forbidden", message)
    }

    pub fn api_status(&self) -> Option<&Status> {
        match self {
            Self::Api(status) => Some(status),
            _ => None,
        }
    }

    pub fn code(&self) -> Option<u16> {
        self.api_status()
            .and_then(|s| s.code)
            .and_then(|c| u16::try_from(c).ok())
    }

    pub fn is_not_found(&self) -> bool {
        self.code() == Some(404)
    }

    pub fn is_conflict(&self) -> bool {
        self.code() == Some(409)
    }

    pub fn is_already_exists(&self) -> bool {
        self.api_status()
            .and_then(|s| s.reason.as_deref())
            .map(|r| r == "AlreadyExists")
            .unwrap_or(false)
    }
}

impl From<kube::Error> for StoreError {
    fn from(error: kube::Error) -> Self {
        match error {
            kube::Error::Api(rsp) => Self::Api(Box::new(Status {
                status: Some(rsp.status),
                code: Some(rsp.code.into()),
                reason: Some(rsp.reason),
                message: Some(rsp.message),
                ..Default::default()
            })),
            error => Self::Client(error),
        }
    }
}

// === impl KubeStore ===

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, resource: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        if namespace.is_empty() {
            Api::all_with(self.client.clone(), resource)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, resource)
        }
    }
}

#[async_trait::async_trait]
impl DynamicStore for KubeStore {
    async fn resolve(&self, gvr: &Gvr) -> Result<ApiResource, StoreError> {
        let gv = GroupVersion::gv(&gvr.group, &gvr.version);
        let group = kube::discovery::oneshot::pinned_group(&self.client, &gv).await?;
        group
            .versioned_resources(&gvr.version)
            .into_iter()
            .map(|(ar, _)| ar)
            .find(|ar| ar.plural == gvr.resource)
            .ok_or_else(|| StoreError::UnknownResource(gvr.clone()))
    }

    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject, StoreError> {
        Ok(self.api(resource, namespace).get(name).await?)
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        params: &ListParams,
    ) -> Result<ObjectList<DynamicObject>, StoreError> {
        Ok(self.api(resource, namespace).list(params).await?)
    }

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        Ok(self
            .api(resource, namespace)
            .create(&PostParams::default(), obj)
            .await?)
    }

    async fn replace(
        &self,
        resource: &ApiResource,
        namespace: &str,
        obj: &DynamicObject,
        subresource: Option<&str>,
    ) -> Result<DynamicObject, StoreError> {
        let api = self.api(resource, namespace);
        let name = obj.metadata.name.clone().unwrap_or_default();
        let pp = PostParams::default();
        match subresource {
            None => Ok(api.replace(&name, &pp, obj).await?),
            Some(sub) => {
                let data = serde_json::to_vec(obj).map_err(|source| StoreError::Decode {
                    kind: resource.kind.clone(),
                    source,
                })?;
                Ok(api.replace_subresource(sub, &name, &pp, data).await?)
            }
        }
    }

    async fn patch(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: &Patch<serde_json::Value>,
        params: &PatchParams,
        subresource: Option<&str>,
    ) -> Result<DynamicObject, StoreError> {
        let api = self.api(resource, namespace);
        match subresource {
            None => Ok(api.patch(name, params, patch).await?),
            Some(sub) => Ok(api.patch_subresource(sub, name, params, patch).await?),
        }
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        params: &DeleteParams,
    ) -> Result<(), StoreError> {
        self.api(resource, namespace).delete(name, params).await?;
        Ok(())
    }

    async fn create_subresource(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        subresource: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, StoreError> {
        let data = serde_json::to_vec(&body).map_err(|source| StoreError::Decode {
            kind: resource.kind.clone(),
            source,
        })?;
        Ok(self
            .api(resource, namespace)
            .create_subresource(subresource, name, &PostParams::default(), data)
            .await?)
    }

    async fn review_access(&self, review: SubjectAccessReview) -> Result<bool, StoreError> {
        let api = Api::<SubjectAccessReview>::all(self.client.clone());
        let rsp = api.create(&PostParams::default(), &review).await?;
        Ok(rsp.status.map(|s| s.allowed).unwrap_or(false))
    }

    async fn raw_get(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        let req = http::Request::get(path)
            .body(Vec::new())
            .map_err(|e| StoreError::Client(kube::Error::HttpError(e)))?;
        let body = self.client.request_text(req).await?;
        Ok(body.into_bytes())
    }
}

impl std::fmt::Debug for KubeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore").finish_non_exhaustive()
    }
}
