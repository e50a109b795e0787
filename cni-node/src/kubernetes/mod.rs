pub mod watch;

use std::time::Duration;

use cni_node_k8s_utils::{SERVICE_OWNER_LABEL, create_store};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::Store;
use kube::runtime::watcher;
use kube::{Api, Client};

use crate::Result;

/// Reflector store holding the pods scheduled on `node_name`.
pub async fn node_pod_store(
    client: Client,
    node_name: &str,
    timeout: Option<Duration>,
) -> Result<Store<Pod>> {
    let api: Api<Pod> = Api::all(client);
    let config = watcher::Config::default().fields(&format!("spec.nodeName={node_name}"));
    Ok(create_store(api, config, timeout).await?)
}

/// Endpoint slices managed on behalf of a Service.
pub fn endpoint_slice_config() -> watcher::Config {
    watcher::Config::default().labels(SERVICE_OWNER_LABEL)
}
