use std::fmt::{self, Debug, Display};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::serde::de::DeserializeOwned;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{WatchStreamExt, reflector, watcher};
use kube::{Api, Resource, ResourceExt};
use thiserror::Error;
use tracing::{error, trace};

/// Label set by the endpoint slice controller naming the owning Service.
pub const SERVICE_OWNER_LABEL: &str = "kubernetes.io/service-name";

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to create store: {0}")]
    StoreCreation(String),

    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("{kind} {name} has no namespace")]
    MissingNamespace { kind: &'static str, name: String },

    #[error("endpoint slice {0} is missing the kubernetes.io/service-name label")]
    MissingServiceLabel(NamespacedName),

    #[error("object cache unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A (namespace, name) pair identifying a namespaced object.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a namespaced resource. Cluster scoped objects end up with an
    /// empty namespace.
    pub fn from_resource<K: ResourceExt>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace().unwrap_or_default(),
            name: obj.name_any(),
        }
    }
}

impl Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Resolves the Service that owns an EndpointSlice.
pub fn service_namespaced_name(slice: &EndpointSlice) -> Result<NamespacedName> {
    let Some(namespace) = slice.namespace() else {
        return Err(Error::MissingNamespace {
            kind: "EndpointSlice",
            name: slice.name_any(),
        });
    };
    let Some(service) = slice.labels().get(SERVICE_OWNER_LABEL) else {
        return Err(Error::MissingServiceLabel(NamespacedName::new(
            namespace,
            slice.name_any(),
        )));
    };
    Ok(NamespacedName::new(namespace, service.to_owned()))
}

pub trait KubeStore<K: k8s_openapi::Metadata + kube::Resource> {
    fn get_store_state(&self) -> Vec<Arc<K>>;
    fn get_resource(&self, key: &ObjectRef<K>) -> Option<Arc<K>>;
}

impl<K> KubeStore<K> for Store<K>
where
    K: k8s_openapi::Metadata + kube::Resource + Clone,
    K::DynamicType: std::hash::Hash + std::cmp::Eq + Clone,
{
    fn get_store_state(&self) -> Vec<Arc<K>> {
        self.state()
    }

    fn get_resource(&self, key: &ObjectRef<K>) -> Option<Arc<K>> {
        self.get(key)
    }
}

/// Point lookup of every EndpointSlice belonging to a Service.
pub trait EndpointSliceLister: Send + Sync {
    fn get_endpoint_slices(
        &self,
        namespace: &str,
        service_name: &str,
    ) -> Result<Vec<Arc<EndpointSlice>>>;
}

impl EndpointSliceLister for Store<EndpointSlice> {
    fn get_endpoint_slices(
        &self,
        namespace: &str,
        service_name: &str,
    ) -> Result<Vec<Arc<EndpointSlice>>> {
        Ok(self
            .state()
            .into_iter()
            .filter(|s| {
                s.namespace().as_deref() == Some(namespace)
                    && s.labels().get(SERVICE_OWNER_LABEL).map(String::as_str) == Some(service_name)
            })
            .collect())
    }
}

/// Spawns a watcher feeding a new reflector store and waits for the first
/// complete list, bounded by `timeout` when one is given.
pub async fn create_store<K>(
    api: Api<K>,
    config: watcher::Config,
    timeout: Option<Duration>,
) -> Result<Store<K>>
where
    K: Resource + Send + Clone + Debug + DeserializeOwned + Sync + 'static,
    <K as Resource>::DynamicType: Default + Eq + Send + DeserializeOwned + Hash + Clone,
{
    let (store, writer) = reflector::store();

    let stream = watcher(api, config)
        .default_backoff()
        .reflect(writer)
        .for_each(|res| async move {
            match res {
                Ok(ev) => trace!("received event: {:?}", ev),
                Err(e) => {
                    error!(%e, "unexpected error with stream")
                }
            }
        });

    tokio::spawn(stream);
    let wait = store.wait_until_ready();
    if let Some(timeout) = timeout {
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::StoreCreation("timed out waiting for store".into()))?
            .map_err(|e| Error::StoreCreation(e.to_string()))?;
    } else {
        wait.await
            .map_err(|e| Error::StoreCreation(e.to_string()))?;
    }
    Ok(store)
}
